// 📖 Feed Reader - Streams <transaction> records from XML into the store
//
// The feed is never held in memory: events are pulled one at a time and only
// the record being assembled is buffered.
//
//   SCANNING  --<transaction>-->  IN_RECORD  --</transaction>-->  SCANNING
//
// Inside a record, <place>, <amount>, <currency>, <card>, <firstName>,
// <lastName>, <middleName> and <inn> are captured wherever they are nested.
// Anything else is ignored.
//
// Validation pass: every record is built, bad ones are logged, nothing is
// pushed. A clean pass switches to loading and rereads the feed from the top;
// a dirty one terminates the store.

use quick_xml::events::Event;
use quick_xml::Reader;
use rust_decimal::Decimal;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Read};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::entities::{Client, Place, Transaction};
use crate::error::{IngestError, ValidationError};
use crate::keys::KeyRegistry;
use crate::store::TransactionStore;

const RECORD_TAG: &[u8] = b"transaction";

// ============================================================================
// FEED SOURCE
// ============================================================================

/// Where the feed comes from. Each pass reopens it from the start.
#[derive(Debug, Clone)]
pub enum FeedSource {
    File(PathBuf),
    Memory(Arc<[u8]>),
}

impl FeedSource {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        FeedSource::Memory(Arc::from(bytes.into()))
    }

    pub fn open(&self) -> std::io::Result<Box<dyn BufRead + Send>> {
        match self {
            FeedSource::File(path) => Ok(Box::new(BufReader::new(File::open(path)?))),
            FeedSource::Memory(bytes) => Ok(Box::new(Cursor::new(Arc::clone(bytes)))),
        }
    }

    /// SHA-256 of the raw feed bytes, hex encoded
    pub fn fingerprint(&self) -> std::io::Result<String> {
        let mut input = self.open()?;
        let mut hasher = Sha256::new();
        let mut chunk = [0u8; 8192];

        loop {
            let read = input.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            hasher.update(&chunk[..read]);
        }

        Ok(format!("{:x}", hasher.finalize()))
    }
}

impl fmt::Display for FeedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedSource::File(path) => write!(f, "{}", path.display()),
            FeedSource::Memory(bytes) => write!(f, "<memory: {} bytes>", bytes.len()),
        }
    }
}

// ============================================================================
// RAW RECORD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Place,
    Amount,
    Currency,
    Card,
    FirstName,
    LastName,
    MiddleName,
    Inn,
}

impl Field {
    fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"place" => Some(Field::Place),
            b"amount" => Some(Field::Amount),
            b"currency" => Some(Field::Currency),
            b"card" => Some(Field::Card),
            b"firstName" => Some(Field::FirstName),
            b"lastName" => Some(Field::LastName),
            b"middleName" => Some(Field::MiddleName),
            b"inn" => Some(Field::Inn),
            _ => None,
        }
    }
}

/// Text of one record's fields, exactly as read
#[derive(Debug, Default)]
struct RawRecord {
    place: String,
    amount: String,
    currency: String,
    card: String,
    first_name: String,
    last_name: String,
    middle_name: String,
    inn: String,
    current: Option<Field>,
}

impl RawRecord {
    fn slot(&mut self, field: Field) -> &mut String {
        match field {
            Field::Place => &mut self.place,
            Field::Amount => &mut self.amount,
            Field::Currency => &mut self.currency,
            Field::Card => &mut self.card,
            Field::FirstName => &mut self.first_name,
            Field::LastName => &mut self.last_name,
            Field::MiddleName => &mut self.middle_name,
            Field::Inn => &mut self.inn,
        }
    }

    /// A repeated field keeps its last value
    fn open_field(&mut self, tag: &[u8]) {
        self.current = Field::from_tag(tag);
        if let Some(field) = self.current {
            self.slot(field).clear();
        }
    }

    fn append(&mut self, text: &str) {
        if let Some(field) = self.current {
            self.slot(field).push_str(text);
        }
    }

    fn close_field(&mut self) {
        self.current = None;
    }

    fn build(&self, serial: u32, keys: &KeyRegistry) -> Result<Transaction, ValidationError> {
        let client = Client::new(&self.first_name, &self.last_name, &self.middle_name, &self.inn)?;
        let place = Place::new(&self.place)?;
        let amount = parse_amount(&self.amount)?;

        Transaction::new(
            amount,
            &self.currency,
            &self.card,
            Arc::new(client),
            Arc::new(place),
            serial,
            keys,
        )
    }
}

impl fmt::Display for RawRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{},{}",
            self.place,
            self.amount,
            self.currency,
            self.card,
            self.first_name,
            self.last_name,
            self.middle_name,
            self.inn
        )
    }
}

/// Significant digits a `Decimal` holds without rounding
const MAX_SIGNIFICANT_DIGITS: usize = 28;

/// Plain or scientific decimal notation, taken as written (no trimming)
fn parse_amount(text: &str) -> Result<Decimal, ValidationError> {
    if text.is_empty() || text.chars().any(char::is_whitespace) {
        return Err(ValidationError::Amount(text.to_string()));
    }

    let mantissa = text.split(['e', 'E']).next().unwrap_or_default();
    let significant = mantissa
        .chars()
        .filter(char::is_ascii_digit)
        .skip_while(|digit| *digit == '0')
        .count();
    if significant > MAX_SIGNIFICANT_DIGITS {
        return Err(ValidationError::Precision(text.to_string()));
    }

    let parsed = if mantissa.len() < text.len() {
        Decimal::from_scientific(text)
    } else {
        Decimal::from_str(text)
    };
    parsed.map_err(|_| ValidationError::Amount(text.to_string()))
}

enum ScanState {
    Scanning,
    InRecord(RawRecord),
}

// ============================================================================
// FEED READER
// ============================================================================

/// What the reader did, returned when its thread ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReaderReport {
    /// Records seen by the last pass
    pub records_read: u32,

    /// Records that failed validation
    pub mistakes: usize,

    /// The load pass reached the end of the feed without a forced stop
    pub completed: bool,
}

#[derive(Debug, Default)]
struct PassStats {
    records: u32,
    mistakes: usize,
}

pub struct FeedReader {
    source: FeedSource,
    store: Arc<TransactionStore>,
    keys: Arc<KeyRegistry>,
    validating: AtomicBool,
}

impl FeedReader {
    pub fn new(
        source: FeedSource,
        store: Arc<TransactionStore>,
        keys: Arc<KeyRegistry>,
        validate_first: bool,
    ) -> Self {
        FeedReader {
            source,
            store,
            keys,
            validating: AtomicBool::new(validate_first),
        }
    }

    /// True until the validation pass is over, whatever its result
    pub fn is_validating(&self) -> bool {
        self.validating.load(Ordering::SeqCst)
    }

    pub fn source(&self) -> &FeedSource {
        &self.source
    }

    /// Run the validation pass (if enabled) then the load pass.
    ///
    /// Always marks the store's producer as finished before returning.
    pub fn run(&self) -> ReaderReport {
        let mut report = ReaderReport::default();

        loop {
            let validating = self.is_validating();
            if validating {
                info!(source = %self.source, "validation pass started");
            } else {
                info!(source = %self.source, "load pass started");
            }

            let outcome = self.scan(validating);
            if validating {
                self.validating.store(false, Ordering::SeqCst);
            }

            match outcome {
                Ok(pass) if validating => {
                    report.records_read = pass.records;
                    report.mistakes = pass.mistakes;
                    info!(records = pass.records, mistakes = pass.mistakes, "validation pass finished");

                    if pass.mistakes == 0 && !self.store.is_terminated() {
                        continue;
                    }
                    error!(
                        source = %self.source,
                        mistakes = pass.mistakes,
                        "feed failed validation, nothing will be loaded"
                    );
                    self.store.terminate();
                }
                Ok(pass) => {
                    report.records_read = pass.records;
                    report.completed = !self.store.is_terminated();
                }
                Err(err) => {
                    if let IngestError::InvalidRecord { serial, .. } = &err {
                        report.records_read = *serial;
                        report.mistakes += 1;
                        error!(
                            serial,
                            error = %err,
                            "run again with validation enabled to list every bad record"
                        );
                    } else {
                        error!(source = %self.source, error = %err, "cannot process feed");
                    }
                    self.store.terminate();
                }
            }
            break;
        }

        self.store.finish_producing();
        if self.store.is_terminated() {
            warn!(records = report.records_read, "reader stopped early");
        } else {
            info!(records = report.records_read, "reader finished");
        }
        report
    }

    /// One pass over the feed from the start
    fn scan(&self, validating: bool) -> Result<PassStats, IngestError> {
        let mut xml = Reader::from_reader(self.source.open()?);
        let mut buf = Vec::new();
        let mut state = ScanState::Scanning;
        let mut stats = PassStats::default();
        let mut depth = 0usize;

        loop {
            if self.store.is_terminated() {
                break;
            }

            let event = xml
                .read_event_into(&mut buf)
                .map_err(|source| IngestError::Syntax {
                    position: xml.buffer_position(),
                    source,
                })?;

            match &event {
                Event::Start(_) => depth += 1,
                Event::End(_) => depth = depth.saturating_sub(1),
                _ => {}
            }

            state = match (state, event) {
                (ScanState::Scanning, Event::Start(start))
                    if start.local_name().as_ref() == RECORD_TAG =>
                {
                    ScanState::InRecord(RawRecord::default())
                }
                (ScanState::Scanning, Event::Empty(empty))
                    if empty.local_name().as_ref() == RECORD_TAG =>
                {
                    stats.records += 1;
                    self.accept(RawRecord::default(), stats.records, validating, &mut stats)?;
                    ScanState::Scanning
                }
                (ScanState::Scanning, Event::Eof) if depth > 0 => {
                    return Err(IngestError::Unclosed { open: depth });
                }
                (ScanState::Scanning, Event::Eof) => break,
                (ScanState::InRecord(mut record), Event::Start(start)) => {
                    record.open_field(start.local_name().as_ref());
                    ScanState::InRecord(record)
                }
                (ScanState::InRecord(mut record), Event::Text(text)) => {
                    let text = text.unescape().map_err(|source| IngestError::Syntax {
                        position: xml.buffer_position(),
                        source,
                    })?;
                    record.append(&text);
                    ScanState::InRecord(record)
                }
                (ScanState::InRecord(mut record), Event::CData(cdata)) => {
                    record.append(&String::from_utf8_lossy(&cdata));
                    ScanState::InRecord(record)
                }
                (ScanState::InRecord(record), Event::End(end))
                    if end.local_name().as_ref() == RECORD_TAG =>
                {
                    stats.records += 1;
                    self.accept(record, stats.records, validating, &mut stats)?;
                    ScanState::Scanning
                }
                (ScanState::InRecord(mut record), Event::End(_)) => {
                    record.close_field();
                    ScanState::InRecord(record)
                }
                (ScanState::InRecord(_), Event::Eof) => {
                    return Err(IngestError::Truncated {
                        serial: stats.records + 1,
                    });
                }
                (state, _) => state,
            };
            buf.clear();
        }

        Ok(stats)
    }

    fn accept(
        &self,
        record: RawRecord,
        serial: u32,
        validating: bool,
        stats: &mut PassStats,
    ) -> Result<(), IngestError> {
        match record.build(serial, &self.keys) {
            Ok(transaction) => {
                if !validating {
                    self.store.push(transaction);
                }
                Ok(())
            }
            Err(source) if validating => {
                stats.mistakes += 1;
                error!(serial, raw = %record, error = %source, "invalid record");
                Ok(())
            }
            Err(source) => Err(IngestError::InvalidRecord { serial, source }),
        }
    }
}
