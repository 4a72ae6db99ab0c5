// src/input.rs
//
// JSONL frame decoding for the runner. One object per line:
//
//   {"ts": 12.5, "detections": [{"id": 7, "cls": 2, "conf": 0.81, "xyxy": [x1, y1, x2, y2]}]}
//
// A line that is not JSON is an error for the whole line. Inside a valid
// line each detection is decoded on its own: one without a usable box is
// skipped and counted, the rest of the frame is kept. Bytes that are not
// UTF-8 spoil only the line they sit on.

use crate::error::InputError;
use crate::types::{BoundingBox, Detection, Frame};
use serde::Deserialize;
use serde_json::Value;
use std::io::BufRead;
use tracing::debug;

/// Newline-delimited reader that decodes UTF-8 per line.
///
/// `BufRead::lines` fails the whole iterator on the first invalid byte
/// sequence; here that only produces an `InputError` for the one line and
/// reading continues. Only an I/O error from the source ends the stream.
pub struct FrameLines<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: BufRead> FrameLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(4096),
        }
    }

    /// `Ok(None)` at end of input.
    pub fn next_line(&mut self) -> std::io::Result<Option<Result<String, InputError>>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf)? == 0 {
            return Ok(None);
        }
        while matches!(self.buf.last(), Some(b'\n' | b'\r')) {
            self.buf.pop();
        }

        match String::from_utf8(std::mem::take(&mut self.buf)) {
            Ok(line) => Ok(Some(Ok(line))),
            Err(e) => {
                let len = e.as_bytes().len();
                self.buf = e.into_bytes();
                Ok(Some(Err(InputError::NotUtf8 { len })))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    ts: Option<f64>,
    #[serde(default)]
    detections: Vec<Value>,
}

#[derive(Debug)]
pub struct ParsedFrame {
    pub frame: Frame,
    /// Detections dropped for a missing or invalid box.
    pub skipped: usize,
}

/// Decode one line. `fallback_ts` is used when the line carries no `ts`.
pub fn parse_frame_line(line: &str, fallback_ts: f64) -> Result<ParsedFrame, InputError> {
    let raw: RawFrame = serde_json::from_str(line)?;
    let timestamp_s = raw.ts.unwrap_or(fallback_ts);
    if !timestamp_s.is_finite() {
        return Err(InputError::BadTimestamp);
    }

    let mut detections = Vec::with_capacity(raw.detections.len());
    let mut skipped = 0;
    for value in &raw.detections {
        match parse_detection(value) {
            Some(det) => detections.push(det),
            None => {
                debug!("Skipping malformed detection: {}", value);
                skipped += 1;
            }
        }
    }

    Ok(ParsedFrame {
        frame: Frame {
            timestamp_s,
            detections,
        },
        skipped,
    })
}

fn parse_detection(value: &Value) -> Option<Detection> {
    let obj = value.as_object()?;

    let coords = obj.get("xyxy")?.as_array()?;
    if coords.len() != 4 {
        return None;
    }
    let mut xyxy = [0.0f32; 4];
    for (slot, v) in xyxy.iter_mut().zip(coords) {
        *slot = v.as_f64()? as f32;
    }
    let bbox = BoundingBox::new(xyxy[0], xyxy[1], xyxy[2], xyxy[3]);
    if !bbox.is_finite() {
        return None;
    }

    // Missing, null, negative or non-integer ids all mean "assign one"
    let identity = obj.get("id").and_then(Value::as_u64);
    let class_id = obj.get("cls").and_then(Value::as_i64).unwrap_or(0);
    let confidence = obj.get("conf").and_then(Value::as_f64).unwrap_or(0.0) as f32;

    Some(Detection::new(identity, class_id, confidence, bbox))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_full_line() {
        let line = r#"{"ts": 12.5, "detections": [{"id": 7, "cls": 2, "conf": 0.8, "xyxy": [1, 2, 30, 40]}]}"#;
        let parsed = parse_frame_line(line, 0.0).unwrap();
        assert_eq!(parsed.skipped, 0);
        assert_eq!(parsed.frame.timestamp_s, 12.5);
        let det = &parsed.frame.detections[0];
        assert_eq!(det.identity, Some(7));
        assert_eq!(det.class_id, 2);
        assert_eq!(det.bbox, BoundingBox::new(1.0, 2.0, 30.0, 40.0));
    }

    #[test]
    fn test_missing_ts_uses_fallback() {
        let parsed = parse_frame_line(r#"{"detections": []}"#, 99.0).unwrap();
        assert_eq!(parsed.frame.timestamp_s, 99.0);
        assert!(parsed.frame.detections.is_empty());
    }

    #[test]
    fn test_negative_or_null_id_needs_assignment() {
        let line = r#"{"ts": 1, "detections": [
            {"id": -1, "xyxy": [0, 0, 20, 20]},
            {"id": null, "xyxy": [0, 0, 20, 20]},
            {"xyxy": [0, 0, 20, 20]}
        ]}"#;
        let parsed = parse_frame_line(line, 0.0).unwrap();
        assert_eq!(parsed.frame.detections.len(), 3);
        assert!(parsed.frame.detections.iter().all(|d| d.identity.is_none()));
    }

    #[test]
    fn test_bad_detection_skipped_individually() {
        let line = r#"{"ts": 1, "detections": [
            {"id": 1, "xyxy": [0, 0, 20]},
            {"id": 2, "xyxy": "nope"},
            "garbage",
            {"id": 3, "xyxy": [0, 0, 20, 20]}
        ]}"#;
        let parsed = parse_frame_line(line, 0.0).unwrap();
        assert_eq!(parsed.skipped, 3);
        assert_eq!(parsed.frame.detections.len(), 1);
        assert_eq!(parsed.frame.detections[0].identity, Some(3));
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(matches!(parse_frame_line("{not json", 0.0), Err(InputError::Json(_))));
    }

    #[test]
    fn test_non_utf8_line_does_not_end_stream() {
        let mut bytes = br#"{"ts": 1, "detections": []}"#.to_vec();
        bytes.extend_from_slice(b"\n\xff\xfe{\"ts\": 2}\n");
        bytes.extend_from_slice(br#"{"ts": 3, "detections": []}"#);
        bytes.extend_from_slice(b"\r\n");
        let mut lines = FrameLines::new(std::io::Cursor::new(bytes));

        let first = lines.next_line().unwrap().unwrap().unwrap();
        assert_eq!(parse_frame_line(&first, 0.0).unwrap().frame.timestamp_s, 1.0);

        let bad = lines.next_line().unwrap().unwrap();
        assert!(matches!(bad, Err(InputError::NotUtf8 { len: 11 })));

        let third = lines.next_line().unwrap().unwrap().unwrap();
        assert_eq!(third, r#"{"ts": 3, "detections": []}"#);
        assert_eq!(parse_frame_line(&third, 0.0).unwrap().frame.timestamp_s, 3.0);

        assert!(lines.next_line().unwrap().is_none());
    }

    #[test]
    fn test_last_line_without_newline_is_read() {
        let mut lines = FrameLines::new(&b"a\n\nb"[..]);
        assert_eq!(lines.next_line().unwrap().unwrap().unwrap(), "a");
        assert_eq!(lines.next_line().unwrap().unwrap().unwrap(), "");
        assert_eq!(lines.next_line().unwrap().unwrap().unwrap(), "b");
        assert!(lines.next_line().unwrap().is_none());
    }
}
