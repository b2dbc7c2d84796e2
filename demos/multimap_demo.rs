use std::env;
use std::process;

use diskmultimap::{Heap, MultiMap, Result};

fn main() {
    env_logger::init();

    let mut args = env::args().skip(1);
    let (Some(path), None) = (args.next(), args.next()) else {
        eprintln!("usage: multimap_demo <file>");
        process::exit(1);
    };

    if let Err(err) = run(&path) {
        eprintln!("error: {err}");
        process::exit(1);
    }
}

fn run(path: &str) -> Result<()> {
    println!("create a disk map with an initial size of 420 bytes");
    let mut heap = Heap::create(path, 420)?;
    let map = MultiMap::create(&mut heap)?;

    println!("inserting values");
    map.insert(&mut heap, "key0", "key0val0")?;
    map.insert(&mut heap, "key0", "key0val1")?;
    map.insert(&mut heap, "key0", "key0val2")?;
    map.insert(&mut heap, "key1", "key1val0")?;
    map.insert(&mut heap, "key1", "key1val1")?;
    map.insert(&mut heap, "key2", "key2val0")?;

    println!("reading values");
    for (key, values) in map.iter(&heap) {
        println!("key {}", String::from_utf8_lossy(key));
        for value in values.keys(&heap) {
            println!("\t val {}", String::from_utf8_lossy(value));
        }
    }

    heap.close()?;
    println!("done");
    Ok(())
}
