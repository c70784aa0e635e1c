use std::fmt::Display;
use std::time::Instant;

use console::style;
use indicatif::ProgressStyle;

pub(crate) fn hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut acc = String::with_capacity(bytes.len() * 2);

    for &byte in bytes {
        acc.push(HEX[(byte >> 4) as usize] as char);
        acc.push(HEX[(byte & 0xF) as usize] as char);
    }

    acc
}

/// Decodes a hex string, with or without a leading `0x`.
pub(crate) fn unhex(text: &str) -> Option<Vec<u8>> {
    let text = text.strip_prefix("0x").unwrap_or(text);

    if text.len() % 2 != 0 {
        return None;
    }

    let digit = |c: u8| match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    };

    text.as_bytes()
        .chunks_exact(2)
        .map(|pair| Some(digit(pair[0])? << 4 | digit(pair[1])?))
        .collect()
}

pub(crate) fn as_overhead(s: Instant) -> impl Display {
    style(format!("(+{}ms)", s.elapsed().as_millis())).blue()
}

pub(crate) fn get_style_task() -> anyhow::Result<ProgressStyle> {
    Ok(ProgressStyle::with_template("{spinner:.green} {msg}")?
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "✓"]))
}

pub(crate) fn get_style_root() -> anyhow::Result<ProgressStyle> {
    Ok(ProgressStyle::with_template(
        "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    )?
    .progress_chars("=>-"))
}

/// Installs a global `tracing` subscriber with an `EnvFilter` (default
/// `info`), a formatting layer, and an indicatif layer that renders progress
/// bars attached to task spans.
///
/// Calling this more than once is harmless; later calls are no-ops.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init();

    Ok(())
}
