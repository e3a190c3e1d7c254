use std::io::{self, Write};

use crate::core::relay_loop::SessionStats;

/// Prints the totals of a finished capture session.
///
/// # Arguments
///
/// * `stats` - Final counters returned by the relay loop
/// * `out` - Destination, stdout in the binary
pub fn print_final_summary<W: Write>(stats: &SessionStats, out: &mut W) -> io::Result<()> {
    writeln!(out, "\n\nCapture summary:")?;

    if stats.packets == 0 {
        writeln!(out, "  No packets captured")?;
    } else {
        writeln!(out, "  packets relayed: {}", stats.packets)?;
    }
    writeln!(out, "  packets missed:  {}", stats.missed)?;
    writeln!(out, "  polls:           {}", stats.ticks)?;

    out.flush()
}
