//! A line-oriented text format for distance and geometry streams, used for
//! traces and for replaying them. A header line names the devices, the
//! timing and, for matrices, the shape:
//!
//! ```text
//! a,b,c 1700000000000 100 3 3
//! ```
//!
//! Each frame line is the sequence number followed by row groups. Values
//! in a group are separated by one space, groups by three:
//!
//! ```text
//! 12 0.00 0.34 -0.12   -0.35 0.00 0.41   0.11 -0.42 0.00
//! ```
//!
//! A distance frame has two groups, deltas then magnitudes. Values are
//! floored to two decimals. A header line may reappear mid-file when the
//! stream's header changed, e.g. after a device joined.

use crate::components::tdoa::DEFAULT_MAX_PLAUSIBLE_DISTANCE_US;
use crate::error::{PipelineError, PipelineResult};
use crate::frame::{DistanceData, FrameData, StreamFrame};
use crate::header::{HeaderKey, HeaderKind, StreamHeader};
use crate::stream::FrameStream;

use log::warn;
use nalgebra::DMatrix;
use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::{char, space1, u64},
    combinator::{all_consuming, map, opt},
    multi::{separated_list0, separated_list1},
    number::complete::double,
    sequence::{preceded, tuple},
    Finish, IResult,
};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A parsed header line.
#[derive(Debug, Clone, PartialEq)]
struct HeaderLine {
    device_ids: Vec<String>,
    start_time: u64,
    frame_time: u64,
    shape: Option<(u64, u64)>,
}

/// A parsed frame line.
#[derive(Debug, Clone, PartialEq)]
struct FrameLine {
    seq_num: u64,
    groups: Vec<Vec<f64>>,
}

fn parse_id(s: &str) -> IResult<&str, String> {
    map(take_while1(|c: char| c != ',' && c != ' '), |id: &str| {
        id.to_owned()
    })(s)
}

fn parse_header_line(s: &str) -> IResult<&str, HeaderLine> {
    map(
        tuple((
            separated_list1(char(','), parse_id),
            preceded(space1, u64),
            preceded(space1, u64),
            opt(tuple((preceded(space1, u64), preceded(space1, u64)))),
        )),
        |(device_ids, start_time, frame_time, shape)| HeaderLine {
            device_ids,
            start_time,
            frame_time,
            shape,
        },
    )(s)
}

fn parse_group(s: &str) -> IResult<&str, Vec<f64>> {
    separated_list0(char(' '), double)(s)
}

fn parse_frame_line(s: &str) -> IResult<&str, FrameLine> {
    map(
        tuple((u64, preceded(char(' '), separated_list0(tag("   "), parse_group)))),
        |(seq_num, groups)| FrameLine { seq_num, groups },
    )(s)
}

fn is_header_line(line: &str) -> bool {
    line.split_whitespace()
        .next()
        .map_or(false, |first| first.contains(','))
}

fn parse_error(line: &str, what: &str) -> PipelineError {
    PipelineError::Parse(format!("{} in line {:?}", what, line))
}

fn floor2(v: f64) -> f64 {
    (v * 100.0).floor() / 100.0
}

fn format_group(values: impl Iterator<Item = f64>) -> String {
    values
        .map(|v| format!("{:.2}", floor2(v)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Renders the header line of a distance or geometry header.
fn format_header(header: &StreamHeader) -> PipelineResult<String> {
    match &header.kind {
        HeaderKind::Distance(pair) => Ok(format!(
            "{} {} {}",
            pair.device_ids.join(","),
            header.start_time,
            header.frame_time
        )),
        HeaderKind::Geometry(shape) => Ok(format!(
            "{} {} {} {} {}",
            shape.device_ids.join(","),
            header.start_time,
            header.frame_time,
            shape.rows,
            shape.cols
        )),
        _ => Err(PipelineError::Validation(format!(
            "{} : only distance and geometry streams have a text form",
            header.id
        ))),
    }
}

/// Renders the line of one frame.
fn format_frame(frame: &StreamFrame) -> PipelineResult<String> {
    let groups: Vec<String> = match &frame.data {
        FrameData::Distance(d) => vec![
            format_group(d.peak_deltas.iter().copied()),
            format_group(d.peak_magnitudes.iter().copied()),
        ],
        FrameData::Geometry(m) => m
            .row_iter()
            .map(|row| format_group(row.iter().copied()))
            .collect(),
        _ => {
            return Err(PipelineError::Validation(format!(
                "frame {} has no text form",
                frame.seq_num
            )))
        }
    };
    Ok(format!("{} {}", frame.seq_num, groups.join("   ")))
}

fn header_from_line(line: &HeaderLine) -> PipelineResult<Arc<StreamHeader>> {
    match line.shape {
        Some((rows, cols)) => Ok(StreamHeader::geometry(
            line.device_ids.clone(),
            line.start_time,
            line.frame_time,
            rows as usize,
            cols as usize,
        )),
        None => match line.device_ids.as_slice() {
            [a, b] => Ok(StreamHeader::distance(
                format!("{}+{}", a, b),
                line.start_time,
                line.frame_time,
                [a.clone(), b.clone()],
                DEFAULT_MAX_PLAUSIBLE_DISTANCE_US,
            )),
            ids => Err(PipelineError::Parse(format!(
                "a distance header relates two devices, not {}",
                ids.len()
            ))),
        },
    }
}

fn data_from_line(header: &StreamHeader, line: FrameLine) -> PipelineResult<FrameData> {
    match &header.kind {
        HeaderKind::Distance(_) => {
            let mut groups = line.groups.into_iter();
            match (groups.next(), groups.next(), groups.next()) {
                (Some(peak_deltas), Some(peak_magnitudes), None)
                    if peak_deltas.len() == peak_magnitudes.len() =>
                {
                    Ok(FrameData::Distance(DistanceData {
                        peak_deltas,
                        peak_magnitudes,
                    }))
                }
                _ => Err(PipelineError::Parse(format!(
                    "distance frame {} needs two groups of equal length",
                    line.seq_num
                ))),
            }
        }
        HeaderKind::Geometry(shape) => {
            let values: Vec<f64> = line.groups.into_iter().flatten().collect();
            if values.len() != shape.rows * shape.cols {
                return Err(PipelineError::Parse(format!(
                    "matrix frame {} has {} values, expected {}x{}",
                    line.seq_num,
                    values.len(),
                    shape.rows,
                    shape.cols
                )));
            }
            Ok(FrameData::Geometry(DMatrix::from_row_slice(
                shape.rows, shape.cols, &values,
            )))
        }
        _ => Err(PipelineError::Validation(format!(
            "{} has no text form",
            header.id
        ))),
    }
}

struct Writer {
    out: Option<BufWriter<File>>,
    header: Option<Arc<StreamHeader>>,
    written: Option<HeaderKey>,
}

impl Writer {
    fn write_header(&mut self, header: &StreamHeader, key: HeaderKey) -> PipelineResult<()> {
        let line = format_header(header)?;
        if let Some(out) = self.out.as_mut() {
            writeln!(out, "{}", line)?;
        }
        self.written = Some(key);
        Ok(())
    }
}

struct Reader {
    lines: Option<Lines<BufReader<File>>>,
    header: Option<Arc<StreamHeader>>,
}

impl Reader {
    fn next_line(&mut self) -> PipelineResult<Option<String>> {
        let Some(lines) = self.lines.as_mut() else {
            return Ok(None);
        };
        for line in lines {
            let line = line?;
            if !line.trim().is_empty() {
                return Ok(Some(line));
            }
        }
        Ok(None)
    }

    fn read_header(&mut self, line: &str) -> PipelineResult<Arc<StreamHeader>> {
        let (_, parsed) = all_consuming(parse_header_line)(line.trim_end())
            .finish()
            .map_err(|_| parse_error(line, "bad header"))?;
        let header = header_from_line(&parsed)?;
        self.header = Some(Arc::clone(&header));
        Ok(header)
    }
}

enum Mode {
    Write(Writer),
    Read(Reader),
}

/// A distance or geometry stream backed by a text file. A stream is either
/// a write-only sink ([TextFileStream::create]) or a read-only source
/// ([TextFileStream::open]); using it the other way round is a protocol
/// violation.
pub struct TextFileStream {
    id: String,
    mode: Mutex<Mode>,
}

impl TextFileStream {
    /// Creates (or truncates) `path` and writes to it.
    pub fn create(id: impl Into<String>, path: impl AsRef<Path>) -> PipelineResult<Self> {
        let file = File::create(path)?;
        Ok(Self {
            id: id.into(),
            mode: Mutex::new(Mode::Write(Writer {
                out: Some(BufWriter::new(file)),
                header: None,
                written: None,
            })),
        })
    }

    /// Reads back a file written by [TextFileStream::create].
    pub fn open(id: impl Into<String>, path: impl AsRef<Path>) -> PipelineResult<Self> {
        let file = File::open(path)?;
        Ok(Self {
            id: id.into(),
            mode: Mutex::new(Mode::Read(Reader {
                lines: Some(BufReader::new(file).lines()),
                header: None,
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Mode> {
        self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn violation(&self, what: &str) -> PipelineError {
        PipelineError::ProtocolViolation(format!("{} : {}", self.id, what))
    }
}

impl FrameStream for TextFileStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn get_header(&self) -> PipelineResult<Option<Arc<StreamHeader>>> {
        match &mut *self.lock() {
            Mode::Write(_) => Err(self.violation("trace sinks cannot be read")),
            Mode::Read(reader) => {
                if let Some(header) = &reader.header {
                    return Ok(Some(Arc::clone(header)));
                }
                match reader.next_line()? {
                    Some(line) if is_header_line(&line) => reader.read_header(&line).map(Some),
                    Some(line) => Err(parse_error(&line, "expected a header")),
                    None => Ok(None),
                }
            }
        }
    }

    fn set_header(&self, header: Arc<StreamHeader>) -> PipelineResult<()> {
        match &mut *self.lock() {
            Mode::Read(_) => Err(self.violation("trace sources cannot be written")),
            Mode::Write(writer) => {
                if writer.out.is_none() {
                    return Err(PipelineError::ClosedPipeline);
                }
                if writer.header.is_some() {
                    return Err(self.violation("header already set"));
                }
                writer.write_header(&header, HeaderKey::of(&header))?;
                writer.header = Some(header);
                Ok(())
            }
        }
    }

    fn send_frame(&self, frame: Arc<StreamFrame>) -> PipelineResult<()> {
        match &mut *self.lock() {
            Mode::Read(_) => Err(self.violation("trace sources cannot be written")),
            Mode::Write(writer) => {
                if writer.out.is_none() {
                    return Ok(());
                }
                let key = frame.header_key();
                if writer.written != Some(key) {
                    let header = frame.header().ok_or_else(|| {
                        PipelineError::Validation("frame outlived its header".to_string())
                    })?;
                    writer.write_header(&header, key)?;
                }
                let line = format_frame(&frame)?;
                if let Some(out) = writer.out.as_mut() {
                    writeln!(out, "{}", line)?;
                    out.flush()?;
                }
                Ok(())
            }
        }
    }

    fn recv_frame(&self) -> PipelineResult<Option<Arc<StreamFrame>>> {
        match &mut *self.lock() {
            Mode::Write(_) => Err(self.violation("trace sinks cannot be read")),
            Mode::Read(reader) => loop {
                let Some(line) = reader.next_line()? else {
                    return Ok(None);
                };
                if is_header_line(&line) {
                    reader.read_header(&line)?;
                    continue;
                }
                let header = reader
                    .header
                    .clone()
                    .ok_or_else(|| parse_error(&line, "frame before any header"))?;
                let (_, parsed) = all_consuming(parse_frame_line)(line.as_str())
                    .finish()
                    .map_err(|_| parse_error(&line, "bad frame"))?;
                let seq_num = parsed.seq_num;
                let data = data_from_line(&header, parsed)?;
                return Ok(Some(header.make_frame_with_seq(seq_num, data)));
            },
        }
    }

    fn close(&self) {
        match &mut *self.lock() {
            Mode::Write(writer) => {
                if let Some(mut out) = writer.out.take() {
                    if let Err(err) = out.flush() {
                        warn!("{} : flushing trace failed : {}.", self.id, err);
                    }
                }
            }
            Mode::Read(reader) => {
                reader.lines = None;
                reader.header = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn pair_header() -> Arc<StreamHeader> {
        StreamHeader::distance("a+b", 1000, 100, ["a".into(), "b".into()], 29_000)
    }

    #[test]
    fn header_lines() {
        let (rest, line) = parse_header_line("a,b,c 1700 100 3 2").unwrap();
        assert_eq!(rest, "");
        assert_eq!(line.device_ids, vec!["a", "b", "c"]);
        assert_eq!((line.start_time, line.frame_time), (1700, 100));
        assert_eq!(line.shape, Some((3, 2)));

        let (_, line) = parse_header_line("a,b 0 100").unwrap();
        assert_eq!(line.shape, None);
        assert!(is_header_line("a,b 0 100"));
        assert!(!is_header_line("12 0.00 1.00"));
    }

    #[test]
    fn frame_lines() {
        let (rest, line) = parse_frame_line("7 0.00 1.50   -1.50 0.00").unwrap();
        assert_eq!(rest, "");
        assert_eq!(line.seq_num, 7);
        assert_eq!(line.groups, vec![vec![0.0, 1.5], vec![-1.5, 0.0]]);

        let (rest, line) = parse_frame_line("3    ").unwrap();
        assert_eq!(rest, "");
        assert_eq!(line.groups, vec![Vec::<f64>::new(), Vec::new()]);
    }

    #[test]
    fn values_are_floored() {
        assert_eq!(format_group([0.349, -0.343, 2.0].into_iter()), "0.34 -0.35 2.00");
    }

    #[test]
    fn distance_trace_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a+b.txt");
        let header = pair_header();

        let sink = TextFileStream::create("sink", &path).unwrap();
        sink.set_header(header.clone()).unwrap();
        let data = DistanceData {
            peak_deltas: vec![-10.0, 20.25],
            peak_magnitudes: vec![20.0, 6.0],
        };
        sink.send_frame(header.make_frame(FrameData::Distance(data)))
            .unwrap();
        sink.send_frame(header.make_frame(FrameData::Distance(DistanceData::default())))
            .unwrap();
        sink.close();
        sink.close();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec!["a,b 1000 100", "0 -10.00 20.25   20.00 6.00", "1    "]
        );

        let source = TextFileStream::open("source", &path).unwrap();
        let read = source.get_header().unwrap().unwrap();
        let pair = read.as_distance().unwrap();
        assert_eq!(pair.device_ids, ["a".to_string(), "b".to_string()]);
        assert_eq!(read.start_time, 1000);

        let first = source.recv_frame().unwrap().unwrap();
        assert_eq!(first.seq_num, 0);
        assert_eq!(first.as_distance().unwrap().peak_deltas, vec![-10.0, 20.25]);
        let second = source.recv_frame().unwrap().unwrap();
        assert!(second.as_distance().unwrap().is_empty());
        assert!(source.recv_frame().unwrap().is_none());
    }

    #[test]
    fn header_is_repeated_when_it_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geometry.txt");
        let small = StreamHeader::geometry(vec!["a".into(), "b".into()], 0, 100, 2, 2);
        let large =
            StreamHeader::geometry(vec!["a".into(), "b".into(), "c".into()], 0, 100, 3, 3);

        let sink = TextFileStream::create("sink", &path).unwrap();
        sink.set_header(small.clone()).unwrap();
        let m2 = DMatrix::from_row_slice(2, 2, &[0.0, 0.5, -0.5, 0.0]);
        sink.send_frame(small.make_frame(FrameData::Geometry(m2)))
            .unwrap();
        let m3 = DMatrix::from_fn(3, 3, |i, j| j as f64 - i as f64);
        sink.send_frame(large.make_frame_with_seq(1, FrameData::Geometry(m3.clone())))
            .unwrap();
        sink.close();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "a,b 0 100 2 2");
        assert_eq!(lines[1], "0 0.00 0.50   -0.50 0.00");
        assert_eq!(lines[2], "a,b,c 0 100 3 3");
        assert_eq!(lines.len(), 4);

        let source = TextFileStream::open("source", &path).unwrap();
        assert_eq!(source.get_header().unwrap().unwrap().id, "a,b");
        assert_eq!(source.recv_frame().unwrap().unwrap().as_geometry().unwrap().nrows(), 2);
        let grown = source.recv_frame().unwrap().unwrap();
        assert_eq!(grown.header().unwrap().id, "a,b,c");
        assert_eq!(grown.as_geometry().unwrap(), &m3);
    }

    #[test]
    fn wrong_direction_is_a_protocol_violation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.txt");
        let sink = TextFileStream::create("sink", &path).unwrap();
        assert!(matches!(
            sink.recv_frame(),
            Err(PipelineError::ProtocolViolation(_))
        ));
        sink.set_header(pair_header()).unwrap();
        assert!(matches!(
            sink.set_header(pair_header()),
            Err(PipelineError::ProtocolViolation(_))
        ));
        sink.close();

        let source = TextFileStream::open("source", &path).unwrap();
        assert!(matches!(
            source.set_header(pair_header()),
            Err(PipelineError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn malformed_lines_are_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.txt");
        fs::write(&path, "a,b 0 100\n4 1.00 2.00\n").unwrap();
        let source = TextFileStream::open("source", &path).unwrap();
        source.get_header().unwrap().unwrap();
        assert!(matches!(source.recv_frame(), Err(PipelineError::Parse(_))));

        fs::write(&path, "5 1.00\n").unwrap();
        let source = TextFileStream::open("source", &path).unwrap();
        assert!(matches!(source.get_header(), Err(PipelineError::Parse(_))));
    }
}
