use std::mem;
use std::sync::Arc;

use bpfload::{Map, MapType, SysKernel};

fn main() {
    let mut map = Map::new(Arc::new(SysKernel),
                           "example",
                           MapType::Hash,
                           mem::size_of::<u32>(),
                           mem::size_of::<u32>(),
                           32);
    map.create().unwrap();

    let key = [1,2,3,4];

    // No key in the map for now
    assert!(map.lookup(&key).is_err());

    let value = [42,42,42,42];
    map.insert(&key, &value).unwrap();

    // After inserting, we can look it up
    assert_eq!(map.lookup(&key).unwrap(), &value[..]);

    // Integers are written at the map's width
    map.upsert(&7u32, &1000u32).unwrap();
    assert_eq!(map.lookup_int(&7u32).unwrap(), 1000);

    // We can iterate all key/value pairs
    for entry in &map {
        let (key, val) = entry.unwrap();
        println!("{:?} => {:?}", key, val);
    }

    // ...and delete stuff again
    map.delete(&key).unwrap();
    assert!(map.lookup(&key).is_err());
}
