// =============================================================================
// impulse_stats — offline summary over a JSONL impulse event log
// =============================================================================
//
// Reads the log ScreenerEngine appends to when `impulse_log_path` is
// configured and reports, per symbol, how many recorded impulses continued
// in their initial direction (rise/fall) past the configured thresholds.
// =============================================================================

use std::collections::HashMap;

use clap::Parser;
use serde::Deserialize;

const STAT_RISE_THRESHOLD_PCT: f64 = 1.0;
const STAT_FALL_THRESHOLD_PCT: f64 = 1.0;

#[derive(Parser)]
#[command(about = "Summarise a JSONL impulse event log")]
struct Args {
    /// Path to the JSONL impulse log
    #[arg(long)]
    log: String,

    /// Restrict the summary to a single symbol
    #[arg(long)]
    symbol: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoggedImpulse {
    symbol: String,
    change_percent_from_start: f64,
}

#[derive(Debug, Default)]
struct SymbolStats {
    total: u64,
    rise_count: u64,
    fall_count: u64,
    neutral_count: u64,
}

fn classify(stats: &mut SymbolStats, change_pct: f64) {
    stats.total += 1;
    if change_pct >= STAT_RISE_THRESHOLD_PCT {
        stats.rise_count += 1;
    } else if change_pct <= -STAT_FALL_THRESHOLD_PCT {
        stats.fall_count += 1;
    } else {
        stats.neutral_count += 1;
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let content = std::fs::read_to_string(&args.log)?;
    let mut by_symbol: HashMap<String, SymbolStats> = HashMap::new();

    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: LoggedImpulse = match serde_json::from_str(line) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("skipping malformed line {}: {e}", line_no + 1);
                continue;
            }
        };
        if let Some(filter) = &args.symbol {
            if &parsed.symbol != filter {
                continue;
            }
        }
        let stats = by_symbol.entry(parsed.symbol).or_default();
        classify(stats, parsed.change_percent_from_start);
    }

    let mut symbols: Vec<&String> = by_symbol.keys().collect();
    symbols.sort();

    for symbol in symbols {
        let s = &by_symbol[symbol];
        println!(
            "{}: total={} rise(>{:.1}%)={} fall(<-{:.1}%)={} neutral={}",
            symbol.to_uppercase(),
            s.total,
            STAT_RISE_THRESHOLD_PCT,
            s.rise_count,
            STAT_FALL_THRESHOLD_PCT,
            s.fall_count,
            s.neutral_count
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_buckets_by_threshold() {
        let mut stats = SymbolStats::default();
        classify(&mut stats, 2.0);
        classify(&mut stats, -2.0);
        classify(&mut stats, 0.1);
        assert_eq!(stats.rise_count, 1);
        assert_eq!(stats.fall_count, 1);
        assert_eq!(stats.neutral_count, 1);
        assert_eq!(stats.total, 3);
    }
}
