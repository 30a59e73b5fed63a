//! Sentinel and filler records for framing sessions in the classifier stream.
//!
//! The classifier has no notion of sessions: it consumes FASTQ records on
//! stdin and emits one tab-separated result line per record, in order. To
//! recover session boundaries from that undifferentiated output, the server
//! injects synthetic records with reserved read ids around each session and
//! recognizes their echoes in the result stream. Filler records are inert
//! padding written after the end sentinel so the classifier's internal batch
//! buffer is forced to flush the echoes out.

/// Read id of the record written before a session's first real record.
pub const START_MARKER: &str = "K2MUX_START";

/// Read id of the record written after a session's last real record.
pub const END_MARKER: &str = "K2MUX_END";

/// Read-id prefix of flush padding written after the end sentinel.
pub const FILLER_PREFIX: &str = "K2MUX_PAD";

const SENTINEL_BASES: usize = 50;

/// Which reserved record a classifier output line echoes, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Start,
    End,
    Filler,
}

/// Build a syntactically valid single-record FASTQ entry for `read_id`.
///
/// The sequence is all `T` with minimum quality, cheap for the classifier to
/// consume and certain to be reported (classified or not) as one line.
pub fn fastq_record(read_id: &str) -> String {
    format!(
        "@{read_id}\n{}\n+\n{}\n",
        "T".repeat(SENTINEL_BASES),
        "!".repeat(SENTINEL_BASES)
    )
}

pub fn start_record() -> String {
    fastq_record(START_MARKER)
}

pub fn end_record() -> String {
    fastq_record(END_MARKER)
}

/// `count` filler records concatenated into one write.
pub fn filler_records(count: usize) -> String {
    (0..count)
        .map(|n| fastq_record(&format!("{FILLER_PREFIX}_{n}")))
        .collect()
}

/// Classify a single output line by its read-id field.
///
/// Classifier output is `<status>\t<read_id>\t...`; only an exact match on
/// the read-id field counts, so result lines whose payload happens to
/// contain a marker string are left alone.
pub fn marker_of(line: &str) -> Option<Marker> {
    let mut fields = line.split('\t');
    let _status = fields.next()?;
    let read_id = fields.next()?;
    if read_id == START_MARKER {
        Some(Marker::Start)
    } else if read_id == END_MARKER {
        Some(Marker::End)
    } else if read_id.starts_with(FILLER_PREFIX) {
        Some(Marker::Filler)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_has_four_fastq_lines() {
        let record = start_record();
        let lines: Vec<&str> = record.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "@K2MUX_START");
        assert_eq!(lines[1].len(), SENTINEL_BASES);
        assert_eq!(lines[2], "+");
        assert_eq!(lines[3].len(), SENTINEL_BASES);
        assert!(record.ends_with('\n'));
    }

    #[test]
    fn filler_records_are_distinct_and_counted() {
        let block = filler_records(3);
        assert_eq!(block.matches('@').count(), 3);
        assert!(block.contains("@K2MUX_PAD_0\n"));
        assert!(block.contains("@K2MUX_PAD_2\n"));
        assert_eq!(filler_records(0), "");
    }

    #[test]
    fn marker_matches_read_id_field_only() {
        assert_eq!(marker_of("U\tK2MUX_START\t0\t50\t0:16"), Some(Marker::Start));
        assert_eq!(marker_of("U\tK2MUX_END\t0"), Some(Marker::End));
        assert_eq!(marker_of("U\tK2MUX_PAD_17\t0"), Some(Marker::Filler));
        // Real read, marker text in a later field: not a sentinel echo.
        assert_eq!(marker_of("C\tread_1\t562\t50\tK2MUX_END:1"), None);
        // Marker in the status field doesn't count either.
        assert_eq!(marker_of("K2MUX_END\tread_1\t0"), None);
    }

    #[test]
    fn marker_ignores_short_or_odd_lines() {
        assert_eq!(marker_of(""), None);
        assert_eq!(marker_of("no tabs here"), None);
        assert_eq!(marker_of("U"), None);
    }
}
