use anyhow::Result;

use anchorage_store::{Config, PortAllocator};

/// Report free and busy ports in the managed store's range.
pub fn show_ports(config: &Config, start: Option<u16>, end: Option<u16>) -> Result<()> {
    let start = start.unwrap_or(config.port_range_start);
    let end = end.unwrap_or(config.port_range_end);
    if start == 0 || start > end {
        anyhow::bail!("Invalid port range {}-{}", start, end);
    }

    let allocator = PortAllocator::localhost();
    let report = allocator.scan(start..=end);

    println!("Ports {}-{} on {}\n", start, end, allocator.host());
    println!(
        "  Preferred: {} ({})",
        config.preferred_port,
        if allocator.is_bindable(config.preferred_port) {
            "free"
        } else {
            "busy"
        }
    );
    println!("  Free: {}", report.available.len());
    println!("  Busy: {}", report.busy.len());

    if !report.busy.is_empty() {
        let busy: Vec<String> = report.busy.iter().map(u16::to_string).collect();
        println!("\n  Busy ports: {}", busy.join(", "));
    }
    if report.is_exhausted() {
        println!("\n  No free ports; widen port_range_start/port_range_end");
    }

    Ok(())
}
