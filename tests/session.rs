use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use _core::{
    encode_frame, ChannelSource, ClientConfig, CodeTable, DisconnectReason, Event, IoSource,
    MindWave, SessionEnd, Value, ValueKind,
};

type Log = Arc<Mutex<Vec<(Event, Value)>>>;

fn log_events(client: &MindWave, log: &Log, events: &[Event]) {
    for &event in events {
        let sink = Arc::clone(log);
        client.register(event, move |value: Value| -> anyhow::Result<()> {
            sink.lock().unwrap().push((event, value));
            Ok(())
        });
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn attention_on_0x02() -> ClientConfig {
    let table = CodeTable::thinkgear()
        .with_code(0x02, Event::Attention, ValueKind::Level)
        .unwrap();
    ClientConfig::default().with_code_table(table)
}

#[test]
fn test_attention_frame_split_across_reads_is_delivered_once() {
    let (tx, source) = ChannelSource::channel(Duration::from_millis(5));
    let mut client = MindWave::new(source, attention_on_0x02());
    let log = Log::default();
    log_events(&client, &log, &[Event::Attention, Event::Meditation]);
    client.start().unwrap();

    tx.send(vec![0x00, 0xAA]).unwrap();
    tx.send(vec![0xAA, 0x02]).unwrap();
    tx.send(vec![0x02, 0x64, 0x99]).unwrap();
    drop(tx);

    let report = client.wait().unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec![(Event::Attention, Value::Level(100))]
    );
    assert_eq!(report.end, SessionEnd::Disconnected(DisconnectReason::EndOfStream));
    assert_eq!(report.stats.bytes_read, 7);
    assert_eq!(report.stats.packets, 1);
}

#[test]
fn test_handler_registered_after_start_sees_later_packets() {
    let (tx, source) = ChannelSource::channel(Duration::from_millis(5));
    let mut client = MindWave::new(source, ClientConfig::default());
    client.start().unwrap();

    tx.send(encode_frame(&[0x05, 0x10]).unwrap()).unwrap();
    assert!(wait_until(Duration::from_secs(2), || client.stats().packets == 1));

    let log = Log::default();
    log_events(&client, &log, &[Event::Meditation]);
    tx.send(encode_frame(&[0x05, 0x20]).unwrap()).unwrap();
    drop(tx);

    let report = client.wait().unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec![(Event::Meditation, Value::Level(0x20))]
    );
    assert_eq!(report.stats.unhandled_records, 1);
}

#[test]
fn test_failing_handler_does_not_block_later_records() {
    let mut bytes = encode_frame(&[0x04, 0x01]).unwrap();
    bytes.extend(encode_frame(&[0x04, 0x02, 0x16, 0x33]).unwrap());
    let mut client = MindWave::new(IoSource::new(Cursor::new(bytes)), ClientConfig::default());

    client.register(Event::Attention, |_: Value| -> anyhow::Result<()> {
        anyhow::bail!("sink closed")
    });
    let log = Log::default();
    log_events(&client, &log, &[Event::BlinkStrength]);

    let report = client.run().unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec![(Event::BlinkStrength, Value::Level(0x33))]
    );
    assert_eq!(report.stats.handler_errors, 2);
    assert_eq!(report.stats.records, 3);
}

#[test]
fn test_corrupt_stream_resyncs_to_valid_packets() {
    let mut bytes = vec![0xAA, 0xAA, 0xC8, 0x01, 0x02];
    bytes.extend([0xAA, 0xAA, 0x02, 0x04, 0x10, 0x00]);
    bytes.extend(encode_frame(&[0x04, 0x2A]).unwrap());
    let mut client = MindWave::new(IoSource::new(Cursor::new(bytes)), ClientConfig::default());
    let log = Log::default();
    log_events(&client, &log, &[Event::Attention]);

    let report = client.run().unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec![(Event::Attention, Value::Level(0x2A))]
    );
    assert_eq!(report.stats.oversized_lengths, 1);
    assert_eq!(report.stats.checksum_errors, 1);
    assert_eq!(report.stats.packets, 1);
}

#[test]
fn test_end_of_stream_emits_disconnected_once() {
    let mut client = MindWave::new(
        IoSource::new(Cursor::new(encode_frame(&[0x16, 0x40]).unwrap())),
        ClientConfig::default(),
    );
    let log = Log::default();
    log_events(&client, &log, &[Event::BlinkStrength, Event::Disconnected]);

    client.run().unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            (Event::BlinkStrength, Value::Level(0x40)),
            (
                Event::Disconnected,
                Value::Disconnected(DisconnectReason::EndOfStream)
            ),
        ]
    );
}

#[test]
fn test_stop_from_another_thread_ends_live_session() {
    let (tx, source) = ChannelSource::channel(Duration::from_millis(5));
    let mut client = MindWave::new(source, ClientConfig::default());
    let log = Log::default();
    log_events(&client, &log, &[Event::Disconnected]);
    client.start().unwrap();
    assert!(client.is_running());

    let stop = client.stop_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        stop.stop();
    });

    let report = client.wait().unwrap();
    stopper.join().unwrap();
    assert_eq!(report.end, SessionEnd::Stopped);
    assert!(log.lock().unwrap().is_empty());
    assert!(!client.is_running());
    drop(tx);
}

#[test]
fn test_stop_returns_report_with_counters() {
    let (tx, source) = ChannelSource::channel(Duration::from_millis(5));
    let mut client = MindWave::new(source, ClientConfig::default());
    client.start().unwrap();

    let mut raw = Vec::new();
    for sample in [-5i16, 0, 7] {
        let [hi, lo] = sample.to_be_bytes();
        raw.extend(encode_frame(&[0x80, 0x02, hi, lo]).unwrap());
    }
    tx.send(raw).unwrap();
    assert!(wait_until(Duration::from_secs(2), || client.stats().records == 3));

    let report = client.stop().unwrap();
    assert_eq!(report.end, SessionEnd::Stopped);
    assert_eq!(report.stats.packets, 3);
    assert_eq!(client.stop(), Some(report));
}
