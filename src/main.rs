mod cli;

use anyhow::Result;
use clap::error::ErrorKind;
use clap::Parser;
use cli::Cli;
use std::io::{Read, Write};
use std::process::ExitCode;
use std::sync::Arc;

use tsmemseg::driver::{self, DriverConfig, Stats};
use tsmemseg::filter::{PacketFilter, Passthrough};
use tsmemseg::publisher::{PublisherConfig, Ring};
use tsmemseg::shutdown::Shutdown;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::from(2);
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "tsmemseg=info,tsmemseg_media=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(msg) = cli.validate() {
        eprintln!("Error: {msg}");
        return ExitCode::from(1);
    }

    if cli.seg_name == "-" {
        return match run_passthrough() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::from(1)
            }
        };
    }

    let stats = match run(&cli) {
        Ok(stats) => stats,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(1);
        }
    };

    if stats.sync_errors > 0 {
        eprintln!("Warning: {} sync error happened.", stats.sync_errors);
    }
    if stats.forced_segmentations > 0 {
        eprintln!(
            "Warning: {} forced segmentation happened.",
            stats.forced_segmentations
        );
    }
    ExitCode::SUCCESS
}

/// `seg_name` of `-`: copy stdin to stdout through the packet filter,
/// creating no endpoints.
fn run_passthrough() -> Result<()> {
    let mut stdin = std::io::stdin().lock();
    let mut stdout = std::io::stdout().lock();
    let mut filter = Passthrough::new();
    let mut buf = [0u8; 188 * 16];
    let mut fill = 0usize;
    loop {
        let n = match stdin.read(&mut buf[fill..]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        fill += n;
        let whole = fill / 188 * 188;
        for packet in buf[..whole].chunks_exact(188) {
            filter.push(packet);
        }
        stdout.write_all(filter.output())?;
        filter.clear();
        buf.copy_within(whole..fill, 0);
        fill -= whole;
    }
    stdout.flush()?;
    Ok(())
}

fn run(cli: &Cli) -> Result<Stats> {
    let ring = Arc::new(Ring::new(PublisherConfig {
        seg_name: cli.seg_name.clone(),
        slot_count: cli.segment_count,
        is_mp4: cli.mp4,
        with_name_blocks: cfg!(unix),
    }));
    let shutdown = Arc::new(Shutdown::new());

    // Endpoints exist for the whole process lifetime: created before any
    // input is read, torn down after the workers are gone.
    #[cfg(unix)]
    let (endpoints, workers) = {
        let endpoints = Arc::new(
            tsmemseg::publisher::unix::FifoEndpoints::create(
                &cli.fifo_dir,
                &cli.seg_name,
                ring.endpoint_count(),
            )
            .map_err(|e| anyhow::anyhow!("FIFO creation failed: {e}"))?,
        );
        tsmemseg::signal::install(endpoints.paths());
        let worker = tsmemseg::publisher::unix::spawn_worker(
            ring.clone(),
            endpoints.clone(),
            shutdown.clone(),
        );
        (endpoints, vec![worker])
    };

    #[cfg(windows)]
    let (workers, stop_event) = {
        let endpoints = tsmemseg::publisher::windows::PipeEndpoints::create(
            &cli.seg_name,
            ring.endpoint_count(),
        )
        .map_err(|e| anyhow::anyhow!("pipe creation failed: {e}"))?;
        tsmemseg::publisher::windows::spawn_workers(ring.clone(), endpoints, shutdown.clone())
    };

    tracing::info!(
        seg_name = %cli.seg_name,
        slots = cli.segment_count,
        mp4 = cli.mp4,
        "endpoints ready, reading from stdin"
    );

    let cfg = DriverConfig {
        is_mp4: cli.mp4,
        init_duration_ms: (cli.init_duration * 1000.0) as u32,
        target_duration_ms: (cli.target_duration * 1000.0) as u32,
        partial_duration_ms: (cli.partial_duration * 1000.0) as u32,
        access_timeout_ms: (cli.access_timeout * 1000.0) as u32,
        read_rate_per_mille: cli.read_rate_per_mille(),
        fill_read_rate_per_mille: cli.fill_read_rate_per_mille(),
        max_bytes: cli.max_kbytes * 1024,
    };
    let mut filter = Passthrough::new();
    let mut stdin = std::io::stdin().lock();
    let stats = driver::run(&cfg, &mut stdin, &mut filter, &ring, &shutdown);

    shutdown.signal();
    #[cfg(windows)]
    stop_event.signal();
    for worker in workers {
        let _ = worker.join();
    }
    #[cfg(unix)]
    endpoints.unlink_all();

    if let Some(command) = &cli.closing_command {
        run_closing_command(command);
    }
    Ok(stats)
}

fn run_closing_command(command: &str) {
    tracing::info!(%command, "running closing command");
    #[cfg(unix)]
    let status = std::process::Command::new("sh").arg("-c").arg(command).status();
    #[cfg(windows)]
    let status = std::process::Command::new("cmd").arg("/C").arg(command).status();
    match status {
        Ok(status) if status.success() => {}
        Ok(status) => tracing::warn!(%command, ?status, "closing command failed"),
        Err(e) => tracing::warn!(%command, "closing command did not start: {e}"),
    }
}
