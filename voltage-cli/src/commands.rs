//! Download command and its terminal progress output

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use voltage_core::config::VoltageConfig;
use voltage_core::torrent::BencodeTorrentParser;
use voltage_core::torrent::parsing::TorrentParser;
use voltage_core::{DownloadCoordinator, DownloadEvent, VoltageError};

/// Downloads `torrent` into `dir`, printing progress until every piece is
/// verified.
///
/// # Errors
/// Returns the first unreadable input or fatal download error
pub fn run_download(dir: &Path, torrent: &Path) -> anyhow::Result<()> {
    let descriptor = BencodeTorrentParser::new()
        .parse_torrent_file(torrent)
        .map_err(VoltageError::from)
        .with_context(|| format!("Unable to open torrent file '{}'", torrent.display()))?;

    println!(" Info Hash: {}", descriptor.info_hash());
    println!(" Piece Size: {}", format_size(u64::from(descriptor.piece_length())));
    println!(" Total Size: {}", format_size(descriptor.total_length()));

    let mut coordinator = DownloadCoordinator::new(
        Arc::new(descriptor),
        dir.to_path_buf(),
        VoltageConfig::from_env(),
        Box::new(render_event),
    )?;

    coordinator.start()?;
    print_status("Starting download ...");

    let mut last_total = 0;
    let mut last_sample = Instant::now();
    let mut speed = format!("{}/s", format_size(0));

    while !coordinator.is_complete() {
        coordinator.tick()?;

        let stats = coordinator.stats();
        let elapsed = last_sample.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let delta = stats.downloaded - last_total;
            speed = format!(
                "{}/s",
                format_size((delta as f64 / elapsed.as_secs_f64()) as u64)
            );
            last_total = stats.downloaded;
            last_sample = Instant::now();
        }

        print_status(&format!(
            "Downloading ... ({:.0}%) ({}/{} peers) ({})",
            stats.progress_percent, stats.connected_peers, stats.known_peers, speed
        ));
    }

    coordinator.finish()?;
    println!("\nDownload complete.");
    Ok(())
}

fn render_event(event: &DownloadEvent) {
    match event {
        DownloadEvent::Allocate {
            allocated_bytes,
            total_bytes,
        } => print_status(&format!(
            "Allocating Files ... ({}%)",
            percent(*allocated_bytes, *total_bytes)
        )),
        DownloadEvent::Check { checked, total } => print_status(&format!(
            "Checking Files ... ({}%)",
            percent(u64::from(*checked), u64::from(*total))
        )),
        DownloadEvent::PeerDisconnected {
            address,
            reason: Some(reason),
        } => tracing::info!("Peer {} dropped: {}", address, reason),
        _ => {}
    }
}

/// Rewrites the current terminal line.
fn print_status(line: &str) {
    print!("{line:<60}\r");
    let _ = io::stdout().flush();
}

fn percent(done: u64, total: u64) -> u64 {
    if total == 0 { 100 } else { done * 100 / total }
}

/// Human-readable size: plain bytes below 1 KiB, otherwise K, M or G with
/// two decimals.
pub fn format_size(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    let value = bytes as f64;

    if bytes < 1024 {
        bytes.to_string()
    } else if value < KIB * KIB {
        format!("{:.2}K", value / KIB)
    } else if value < KIB * KIB * KIB {
        format!("{:.2}M", value / (KIB * KIB))
    } else {
        format!("{:.2}G", value / (KIB * KIB * KIB))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0");
        assert_eq!(format_size(1023), "1023");
        assert_eq!(format_size(1024), "1.00K");
        assert_eq!(format_size(16384), "16.00K");
        assert_eq!(format_size(1536 * 1024), "1.50M");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00G");
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(5, 10), 50);
        assert_eq!(percent(0, 0), 100);
    }

    #[test]
    fn test_missing_torrent_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_download(dir.path(), &dir.path().join("missing.torrent"));

        let error = result.unwrap_err();
        assert!(error.to_string().contains("missing.torrent"));
        assert!(error.downcast_ref::<VoltageError>().is_some());
    }
}
