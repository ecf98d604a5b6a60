//! Command-line host for the shared channel: an echo worker, a throughput run
//! and a bootstrap transcript checker.

use std::io::{self, BufRead, Write};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use runtime_native::{
    ControlTag, EchoInterpreter, HostHandshake, HostState, WorkerConfig, WorkerHost,
    DEFAULT_CHANNEL_CAPACITY,
};
use shared_channel::{Envelope, Sender, SharedChannel};
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

const LINE_ENVELOPE: Envelope = Envelope::new(1, 1);

/// Text rendering helpers used by the CLI commands.
mod render {
    use std::time::Duration;

    use runtime_native::{ControlTag, HostState};

    /// Summary of a throughput run.
    pub struct BenchReport {
        pub messages: usize,
        pub size: usize,
        pub capacity: usize,
        pub elapsed: Duration,
    }

    impl BenchReport {
        pub fn bytes(&self) -> usize {
            self.messages * self.size
        }
    }

    /// Format the outcome of a bench run.
    pub fn bench(report: &BenchReport) -> String {
        let secs = report.elapsed.as_secs_f64().max(f64::EPSILON);
        let mib = report.bytes() as f64 / (1024.0 * 1024.0);
        format!(
            "{} messages x {} bytes through a {} byte arena in {:.3}s\n{:.1} msg/s, {:.2} MiB/s\n",
            report.messages,
            report.size,
            report.capacity,
            report.elapsed.as_secs_f64(),
            report.messages as f64 / secs,
            mib / secs,
        )
    }

    /// Format one accepted transcript step.
    pub fn handshake_step(index: usize, tag: ControlTag, state: HostState) -> String {
        format!("{index}. {tag} -> {state:?}")
    }
}

/// Drive a shared-memory channel from the command line.
#[derive(Parser, Debug)]
#[command(author, version, about = "Exercise the shared-memory SPSC channel", long_about = None)]
struct Cli {
    /// Arena size of each channel in bytes (decimal, hex, or with a k/m suffix).
    #[arg(long, global = true, value_parser = parse_size, default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    capacity: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send stdin lines to an echo worker and print what comes back.
    Echo {
        /// Script handed to the worker's `run`; echoed before any input.
        #[arg(long)]
        source: Option<String>,
        /// Seconds to wait for the worker to load.
        #[arg(long, default_value_t = 5)]
        handshake_timeout: u64,
    },
    /// Push messages from one thread to another and report throughput.
    Bench {
        /// Number of messages to send.
        #[arg(long, value_parser = parse_size, default_value = "100000")]
        messages: usize,
        /// Payload size of each message in bytes.
        #[arg(long, value_parser = parse_size, default_value = "64")]
        size: usize,
    },
    /// Check a bootstrap transcript (e.g. `loaded set_channel_buffers run`) against the host rules.
    Handshake {
        /// Control message tags in the order they travel.
        #[arg(required = true, value_parser = parse_control_tag)]
        tags: Vec<ControlTag>,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Echo {
            source,
            handshake_timeout,
        } => {
            let config = WorkerConfig::default()
                .with_name("echo-worker")
                .with_channel_capacity(cli.capacity)
                .with_handshake_timeout(Duration::from_secs(handshake_timeout));
            handle_echo(config, source.as_deref())
        }
        Command::Bench { messages, size } => {
            let report = handle_bench(cli.capacity, messages, size)?;
            print!("{}", render::bench(&report));
            Ok(())
        }
        Command::Handshake { tags } => {
            for line in handle_handshake(&tags)? {
                println!("{line}");
            }
            Ok(())
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Ignore error if already set (e.g., during tests).
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .try_init();
}

fn handle_echo(config: WorkerConfig, source: Option<&str>) -> Result<()> {
    let mut host = WorkerHost::spawn(config, EchoInterpreter).context("failed to start worker")?;
    host.run(source).context("failed to start interpreter")?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if source.is_some() {
        let greeting = host.recv().context("worker did not echo its source")?;
        writeln!(out, "{}", greeting.text()?)?;
    }

    for line in io::stdin().lock().lines() {
        let line = line.context("failed to read stdin")?;
        host.send(LINE_ENVELOPE, line.as_bytes())
            .with_context(|| format!("failed to send {} bytes", line.len()))?;
        let reply = host.recv().context("worker stopped replying")?;
        writeln!(out, "{}", reply.text()?)?;
    }

    host.join().context("worker failed")?;
    Ok(())
}

fn handle_bench(capacity: usize, messages: usize, size: usize) -> Result<render::BenchReport> {
    if size == 0 || size > capacity {
        bail!("message size {size} must be between 1 and the capacity {capacity}");
    }

    let channel = SharedChannel::new(capacity).context("failed to allocate channel")?;
    let (mut tx, mut rx) = channel.split()?;
    let expected = messages * size;
    info!(messages, size, capacity, "starting bench");

    let started = Instant::now();
    let producer = thread::Builder::new()
        .name("bench-producer".to_owned())
        .spawn(move || -> Result<()> {
            let payload: Vec<u8> = (0..size).map(|i| i as u8).collect();
            for _ in 0..messages {
                send_with_backpressure(&mut tx, &payload)?;
            }
            Ok(())
        })?;

    let mut received = 0usize;
    let mut buf = vec![0u8; capacity];
    while received < expected {
        received += rx.recv_into(&mut buf)?;
    }
    let elapsed = started.elapsed();

    match producer.join() {
        Ok(result) => result?,
        Err(_) => bail!("bench producer panicked"),
    }
    debug!(snapshot = ?channel.snapshot(), "bench finished");

    Ok(render::BenchReport {
        messages,
        size,
        capacity,
        elapsed,
    })
}

fn handle_handshake(tags: &[ControlTag]) -> Result<Vec<String>> {
    let mut host = HostHandshake::new();
    let mut lines = Vec::with_capacity(tags.len());
    for (index, &tag) in tags.iter().enumerate() {
        let state = host
            .apply(tag)
            .with_context(|| format!("step {index} ({tag}) rejected"))?;
        lines.push(render::handshake_step(index, tag, state));
    }
    if host.state() != HostState::Running {
        bail!("transcript ends in {:?} before any run", host.state());
    }
    Ok(lines)
}

fn send_with_backpressure(tx: &mut Sender, payload: &[u8]) -> Result<()> {
    loop {
        match tx.send(payload) {
            Err(err) if err.is_full() => tx.wait_for_space(payload.len())?,
            other => return other.map_err(Into::into),
        }
    }
}

fn parse_control_tag(input: &str) -> Result<ControlTag, String> {
    ControlTag::parse(input).map_err(|err| err.to_string())
}

fn parse_size(input: &str) -> Result<usize, String> {
    let lower = input.to_ascii_lowercase();
    let (digits, scale) = if let Some(stripped) = lower.strip_suffix('k') {
        (stripped, 1024)
    } else if let Some(stripped) = lower.strip_suffix('m') {
        (stripped, 1024 * 1024)
    } else {
        (lower.as_str(), 1)
    };

    let value = if let Some(hex) = digits.strip_prefix("0x") {
        usize::from_str_radix(hex, 16).map_err(|_| format!("invalid hex value '{input}'"))?
    } else {
        digits
            .parse::<usize>()
            .map_err(|_| format!("invalid number '{input}'"))?
    };
    value
        .checked_mul(scale)
        .ok_or_else(|| format!("size '{input}' overflows"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_snapshot;

    #[test]
    fn sizes_accept_suffixes_and_hex() {
        assert_eq!(parse_size("64"), Ok(64));
        assert_eq!(parse_size("0x40"), Ok(64));
        assert_eq!(parse_size("4k"), Ok(4096));
        assert_eq!(parse_size("2M"), Ok(2 * 1024 * 1024));
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn bench_report_text() {
        let report = render::BenchReport {
            messages: 1000,
            size: 64,
            capacity: 4096,
            elapsed: Duration::from_millis(500),
        };
        assert_snapshot!(render::bench(&report).trim_end(), @r"
        1000 messages x 64 bytes through a 4096 byte arena in 0.500s
        2000.0 msg/s, 0.12 MiB/s
        ");
    }

    #[test]
    fn bench_moves_every_byte() {
        let report = handle_bench(256, 500, 48).expect("bench");
        assert_eq!(report.bytes(), 24_000);
    }

    #[test]
    fn bench_rejects_oversized_messages() {
        assert!(handle_bench(32, 10, 33).is_err());
    }

    #[test]
    fn handshake_transcript_lists_each_state() {
        let tags = [
            ControlTag::Loaded,
            ControlTag::SetChannelBuffers,
            ControlTag::Run,
        ];
        let lines = handle_handshake(&tags).expect("valid transcript");
        assert_snapshot!(lines.join("\n"), @r"
        0. loaded -> Loaded
        1. set_channel_buffers -> Ready
        2. run -> Running
        ");
    }

    #[test]
    fn handshake_rejects_out_of_order_and_unknown_tags() {
        assert!(handle_handshake(&[ControlTag::Run]).is_err());
        assert!(handle_handshake(&[ControlTag::Loaded, ControlTag::SetChannelBuffers]).is_err());
        assert!(Cli::try_parse_from(["channel-cli", "handshake", "loaded", "reboot"]).is_err());

        let cli = Cli::try_parse_from(["channel-cli", "handshake", "loaded", "run"]).expect("parse");
        assert!(matches!(cli.command, Command::Handshake { tags } if tags.len() == 2));
    }

    #[test]
    fn cli_parses_bench_arguments() {
        let cli = Cli::try_parse_from([
            "channel-cli",
            "bench",
            "--messages",
            "10",
            "--size",
            "1k",
            "--capacity",
            "8k",
        ])
        .expect("parse");
        assert_eq!(cli.capacity, 8192);
        assert!(matches!(cli.command, Command::Bench { messages: 10, size: 1024 }));
    }
}
