//! Walk a saved heap.
//!
//! ```text
//! cargo run --example inspect_snapshot -- heap.json x86_64 <malloc_zones> [address...]
//! ```
//!
//! `<malloc_zones>` is the address of the zone registry pointer. Each extra
//! address is resolved against every zone.

use std::{env, error::Error, process};

use magheap::{
    inspect::Inspector,
    layout::{layout_for, Architecture, SizeClass},
    serialize::serde_addr::parse_addr,
    source::Snapshot,
};

fn main() -> Result<(), Box<dyn Error>> {
    magheap::logging::init();
    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() < 3 {
        eprintln!("usage: inspect_snapshot <snapshot.json> <arch> <registry> [address...]");
        process::exit(2);
    }
    let snapshot = Snapshot::from_file(&args[0])?;
    let arch: Architecture = args[1].parse()?;
    let registry = parse_addr(&args[2]).ok_or("bad registry address")?;
    let layout = layout_for(arch, 8)?;
    let inspector = Inspector::new(&snapshot, layout);

    for zone in inspector.zones(registry)? {
        let zone = match zone {
            Ok(zone) => zone,
            Err(e) => {
                println!("zone skipped: {e}");
                continue;
            }
        };
        println!("zone {:#x} {}", zone.address, zone.name.as_deref().unwrap_or("(unnamed)"));
        let complex = match inspector.complex_zones(&zone) {
            Ok(complex) => complex,
            Err(e) => {
                println!("  {e}");
                continue;
            }
        };
        for cz in &complex {
            for class in SizeClass::ALL {
                for magazine in inspector.magazines(cz, class) {
                    let magazine = match magazine {
                        Ok(m) => m,
                        Err(e) => {
                            println!("  {e}");
                            continue;
                        }
                    };
                    let ring = inspector.region_ring(cz, &magazine);
                    let free = inspector.free_list(cz, &magazine);
                    println!(
                        "  {class} magazine {:>2}: {} regions ({:?}), {} free blocks",
                        magazine.index,
                        ring.regions.len(),
                        ring.status(),
                        free.blocks().count()
                    );
                    for slot in free.slots.iter().filter(|s| !s.blocks.is_empty()) {
                        println!("    slot {:>3}: {:x?} {:?}", slot.index, slot.addresses(), slot.status());
                    }
                }
            }
        }
        for address in args[3..].iter().filter_map(|a| parse_addr(a)) {
            println!("  {address:#x}: {:?}", inspector.resolve(&zone, address)?);
        }
    }
    Ok(())
}
