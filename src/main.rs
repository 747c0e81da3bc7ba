use std::f64::consts::PI;
use std::fs::File;
use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{ArgAction, ArgGroup, Parser};
use log::error;

use _core::logging::{init_rust_logging, level_for_verbosity};
use _core::{
    encode_frame, ChannelSource, ClientConfig, Event, Handler, IoSource, MindWave, SessionEnd,
    Value,
};

#[derive(Parser, Debug)]
#[command(
    name = "mindwave-demo",
    about = "Connect to a MindWave headset and print decoded values"
)]
#[command(group(
    ArgGroup::new("input")
        .required(true)
        .args(["mac", "serial", "replay", "simulate"])
))]
struct Args {
    /// Bluetooth MAC address of a paired headset (e.g. A4:DA:32:70:03:4E)
    #[arg(long)]
    mac: Option<String>,
    /// Serial device bound to the headset (e.g. /dev/rfcomm0)
    #[arg(long)]
    serial: Option<String>,
    /// Raw byte capture to replay
    #[arg(long)]
    replay: Option<PathBuf>,
    /// Generate synthetic packets instead of reading a headset
    #[arg(long)]
    simulate: bool,
    /// How long to read before stopping
    #[arg(long, default_value_t = 30)]
    seconds: u64,
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_rust_logging(level_for_verbosity(args.verbose));

    let config = ClientConfig::default();
    let mut mw = if let Some(mac) = &args.mac {
        println!("--- Connecting to {mac} over RFCOMM ---");
        MindWave::connect_bluetooth(mac, config)?
    } else if let Some(path) = &args.serial {
        println!("--- Opening {path} ---");
        MindWave::connect_serial(path, config)?
    } else if let Some(path) = &args.replay {
        println!("--- Replaying {} ---", path.display());
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        MindWave::new(IoSource::new(file), config)
    } else {
        println!("--- Simulated headset ---");
        let (tx, source) = ChannelSource::channel(config.read_timeout);
        let seconds = args.seconds;
        thread::Builder::new()
            .name("mindwave-simulator".into())
            .spawn(move || {
                if let Err(e) = simulate(tx, Duration::from_secs(seconds)) {
                    error!("simulator stopped: {e:#}");
                }
            })?;
        MindWave::new(source, config)
    };

    mw.register(Event::Attention, print_level("Attention"));
    mw.register(Event::Meditation, print_level("Meditation"));
    mw.register(Event::BlinkStrength, print_level("Blink Strength"));
    mw.register(Event::SignalQuality, print_level("Poor Signal"));
    mw.register(Event::PowerBands, |v: Value| -> anyhow::Result<()> {
        if let Some(bands) = v.as_power_bands() {
            println!("Power Bands: {bands:?}");
        }
        Ok(())
    });

    let samples = AtomicU64::new(0);
    mw.register(Event::Eeg, move |v: Value| -> anyhow::Result<()> {
        let n = samples.fetch_add(1, Ordering::Relaxed) + 1;
        if n % 512 == 0 {
            println!("EEG: {} samples, last {:?}", n, v.as_raw());
        }
        Ok(())
    });
    mw.register(Event::Disconnected, |v: Value| -> anyhow::Result<()> {
        println!("Disconnected: {v:?}");
        Ok(())
    });

    mw.start()?;
    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    while mw.is_running() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(100));
    }

    println!("Stopping...");
    let report = mw.stop().context("session never started")?;
    match &report.end {
        SessionEnd::Stopped => println!("Stopped after {}s.", args.seconds),
        SessionEnd::Disconnected(reason) => println!("Session ended: {reason}"),
    }
    let s = report.stats;
    println!(
        "Bytes: {} | Packets: {} | Records: {} | Dropped: {} (checksum {}, oversized {}, decode {}) | Handler errors: {}",
        s.bytes_read,
        s.packets,
        s.records,
        s.dropped_packets(),
        s.checksum_errors,
        s.oversized_lengths,
        s.decode_errors,
        s.handler_errors
    );
    Ok(())
}

fn print_level(label: &'static str) -> impl Handler {
    move |v: Value| -> anyhow::Result<()> {
        if let Some(level) = v.as_level() {
            println!("{label}: {level}");
        }
        Ok(())
    }
}

/// Feed 512 Hz raw samples plus one eSense packet per second until `duration`.
fn simulate(tx: Sender<Vec<u8>>, duration: Duration) -> Result<()> {
    let start = Instant::now();
    let mut tick: u64 = 0;
    while start.elapsed() < duration {
        let mut chunk = Vec::new();
        for _ in 0..16 {
            let t = tick as f64 / 512.0;
            let sample = (200.0 * (2.0 * PI * 10.0 * t).sin()) as i16;
            let [hi, lo] = sample.to_be_bytes();
            chunk.extend(encode_frame(&[0x80, 0x02, hi, lo])?);
            tick += 1;
        }

        if tick % 512 == 0 {
            let second = tick / 512;
            let attention = (40 + second * 7 % 50) as u8;
            let meditation = (60 - second * 3 % 40) as u8;
            let mut payload = vec![0x02, 0x00, 0x04, attention, 0x05, meditation, 0x83, 24];
            for band in 0..8u32 {
                let power = (band + 1) * 1000 + (second as u32 % 100) * 10;
                payload.extend(&power.to_be_bytes()[1..]);
            }
            chunk.extend(encode_frame(&payload)?);
            if second % 5 == 0 {
                chunk.extend(encode_frame(&[0x16, 90])?);
            }
        }

        if tx.send(chunk).is_err() {
            break;
        }
        thread::sleep(Duration::from_millis(31));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    use _core::{decode, CodeTable, FrameParser};

    #[test]
    fn test_simulated_stream_is_valid_thinkgear() {
        let (tx, rx) = mpsc::channel();
        simulate(tx, Duration::from_millis(1500)).unwrap();

        let mut parser = FrameParser::new();
        let table = CodeTable::thinkgear();
        let mut events = Vec::new();
        for chunk in rx.try_iter() {
            parser.feed(&chunk);
            while let Some(packet) = parser.next_packet() {
                events.extend(decode(&table, &packet).unwrap().into_iter().map(|r| r.event));
            }
        }

        assert_eq!(parser.stats().checksum_errors, 0);
        assert!(events.contains(&Event::Eeg));
        assert!(events.contains(&Event::Attention));
        assert!(events.contains(&Event::PowerBands));
    }

    #[test]
    fn test_simulator_ends_when_reader_is_gone() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let started = Instant::now();
        assert!(simulate(tx, Duration::from_secs(30)).is_ok());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
