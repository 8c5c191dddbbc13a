use std::io::{self, BufRead, Write};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::Receiver;
use tally_metrics::{IngestStats, Ingester};

/// Longest accepted line in bytes. Longer lines are discarded up to their newline.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Feeds all lines of `reader` into the engine until the end of input.
///
/// Input is handed over in chunks of complete lines as they become available. A trailing line
/// without a newline is ingested at the end. Lines that are not valid UTF-8 or longer than
/// [`MAX_LINE_LENGTH`] are counted as rejected.
pub fn ingest_stream<R: BufRead>(mut reader: R, ingester: &Ingester) -> io::Result<IngestStats> {
    let mut total = IngestStats::default();
    let mut pending = Vec::new();
    let mut discarding = false;

    loop {
        let buf = match reader.fill_buf() {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        if buf.is_empty() {
            break;
        }

        let consumed = match buf.iter().rposition(|&b| b == b'\n') {
            Some(pos) => {
                let start = match discarding {
                    // The oversized line ends at the first newline.
                    true => buf.iter().position(|&b| b == b'\n').map_or(0, |first| first + 1),
                    false => 0,
                };
                pending.extend_from_slice(&buf[start..=pos]);
                discarding = false;
                pos + 1
            }
            None => {
                if !discarding {
                    pending.extend_from_slice(buf);
                }
                buf.len()
            }
        };
        reader.consume(consumed);

        if pending.last() == Some(&b'\n') {
            add(&mut total, ingest_chunk(ingester, &pending));
            pending.clear();
        } else if pending.len() > MAX_LINE_LENGTH {
            tally_log::warn!(
                limit = MAX_LINE_LENGTH,
                "input line exceeds the maximum length, discarding it"
            );
            total.rejected += 1;
            pending.clear();
            discarding = true;
        }
    }

    if !pending.is_empty() {
        add(&mut total, ingest_chunk(ingester, &pending));
    }

    Ok(total)
}

fn ingest_chunk(ingester: &Ingester, chunk: &[u8]) -> IngestStats {
    if let Ok(input) = std::str::from_utf8(chunk) {
        return ingester.ingest_lines(input);
    }

    let mut valid = String::with_capacity(chunk.len());
    let mut invalid = 0;
    for line in chunk.split(|&b| b == b'\n') {
        match std::str::from_utf8(line) {
            Ok(line) => {
                valid.push_str(line);
                valid.push('\n');
            }
            Err(_) => invalid += 1,
        }
    }

    tally_log::debug!(lines = invalid, "dropped input lines that are not valid UTF-8");
    let mut stats = ingester.ingest_lines(&valid);
    stats.rejected += invalid;
    stats
}

fn add(total: &mut IngestStats, stats: IngestStats) {
    total.accepted += stats.accepted;
    total.rejected += stats.rejected;
}

/// Spawns a thread that writes every output buffer to `writer`.
///
/// The thread exits once all senders of `buffers` are dropped.
pub fn spawn_writer<W>(
    buffers: Receiver<Bytes>,
    mut writer: W,
) -> io::Result<JoinHandle<io::Result<()>>>
where
    W: Write + Send + 'static,
{
    thread::Builder::new()
        .name("output".to_owned())
        .spawn(move || {
            for buffer in buffers {
                writer.write_all(&buffer)?;
                writer.flush()?;
            }
            Ok(())
        })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    use tally_metrics::{Engine, EngineConfig, GaugeOp, MetricKind, VecSink};

    use super::*;

    fn engine() -> (Engine, VecSink) {
        let mut config = EngineConfig::default();
        config.self_stats.enable = false;
        config.stats.base.enable = false;
        config.histo.enable = false;

        let sink = VecSink::new();
        let engine = Engine::new(&config, Arc::new(sink.clone())).unwrap();
        (engine, sink)
    }

    #[test]
    fn test_ingest_stream() {
        tally_test::setup();
        let (mut engine, sink) = engine();

        // A tiny buffer splits lines across reads.
        let input = "a.b:1|c\r\nbroken\na.b:2|c\n\ng.x:7|g\ng.x:-2|g";
        let reader = io::BufReader::with_capacity(4, Cursor::new(input));
        let stats = ingest_stream(reader, &engine.ingester()).unwrap();

        assert_eq!(stats.accepted, 4);
        assert_eq!(stats.rejected, 1);

        engine.tick(1_700_000_000_000);
        let output = sink.take_text();
        assert_eq!(tally_test::sorted_lines(&output), ["a.b 3.000000", "g.x 5.000000"]);
    }

    #[test]
    fn test_ingest_rejects_invalid_utf8() {
        let (engine, _sink) = engine();

        let input: &[u8] = b"ok:1|c\n\xff:1|c\n\xfe:1|c\n";
        let stats = ingest_stream(Cursor::new(input), &engine.ingester()).unwrap();

        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected, 2);
        assert!(engine.locate(MetricKind::Adder, "ok").is_some());
        assert!(engine.locate(MetricKind::Adder, "\u{fffd}").is_none());
    }

    #[test]
    fn test_ingest_discards_overlong_lines() {
        let (engine, _sink) = engine();

        let mut input = vec![b'x'; MAX_LINE_LENGTH + 5000];
        input.extend_from_slice(b"\nok:1|c\n");
        let reader = io::BufReader::with_capacity(1024, Cursor::new(input));
        let stats = ingest_stream(reader, &engine.ingester()).unwrap();

        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected, 1);
        assert!(engine.locate(MetricKind::Adder, "ok").is_some());
    }

    #[derive(Clone, Default)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_writer_drains_channel() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let out = SharedWriter::default();
        let thread = spawn_writer(rx, out.clone()).unwrap();

        tx.send(Bytes::from_static(b"a 1.000000\n")).unwrap();
        tx.send(Bytes::from_static(b"b 2.000000\n")).unwrap();
        drop(tx);

        thread.join().unwrap().unwrap();
        assert_eq!(&*out.0.lock().unwrap(), b"a 1.000000\nb 2.000000\n");
    }

    #[test]
    fn test_engine_ingest_matches_stream() {
        let (mut engine, sink) = engine();
        engine
            .ingest(MetricKind::Adder, "direct", 2.0, GaugeOp::Set)
            .unwrap();
        ingest_stream(Cursor::new("direct:3|c|@0.5\n"), &engine.ingester()).unwrap();

        engine.tick(1_700_000_000_000);
        assert_eq!(sink.take_text(), "direct 8.000000\n");
    }
}
