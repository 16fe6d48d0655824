// Copyright 2024 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Columnar output files.
//!
//! Session batches and histogram snapshots are written as parquet
//! files. Files are written under a `.tmp` suffix and become visible to
//! their consumers only through an atomic rename; a failed write
//! removes the temporary file on the way out. Missing parent
//! directories are created on demand.
//!
//! File names follow `<base>-<startTS>_<stopTS>.parquet` with RFC 3339
//! UTC timestamps whose colons are replaced by dashes so the names
//! never need shell escaping.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use crossbeam_channel::Receiver;
use log::{error, info};
use parquet::basic::Compression;
use parquet::data_type::{ByteArray, ByteArrayType, Int32Type, Int64Type};
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use parquet::file::writer::{SerializedFileWriter, SerializedRowGroupWriter};
use parquet::schema::parser::parse_message_type;

use crate::collector::{SessionBatch, Snapshot};
use crate::name::Name;

/// The file-name base of histogram files.
pub const HISTOGRAM_BASE: &str = "dns_histogram";

/// The file-name base of session files.
pub const SESSION_BASE: &str = "dns_session_block";

/// The number of label columns in both schemas.
pub const LABEL_SLOTS: usize = 10;

////////////////////////////////////////////////////////////////////////
// SESSION ROWS                                                       //
////////////////////////////////////////////////////////////////////////

/// One row of a session file. All metadata is optional; addresses are
/// pseudonymised before the row is built.
#[derive(Clone, Debug, Default)]
pub struct SessionRow {
    pub labels: [Option<String>; LABEL_SLOTS],
    pub server_id: Option<Vec<u8>>,
    pub query_time: Option<i64>,
    pub response_time: Option<i64>,
    pub source_ipv4: Option<i32>,
    pub dest_ipv4: Option<i32>,
    pub source_ipv6_network: Option<i64>,
    pub source_ipv6_host: Option<i64>,
    pub dest_ipv6_network: Option<i64>,
    pub dest_ipv6_host: Option<i64>,
    pub source_port: Option<i32>,
    pub dest_port: Option<i32>,
    pub dns_protocol: Option<i32>,
    pub query_message: Option<Vec<u8>>,
    pub response_message: Option<Vec<u8>>,
}

const SESSION_SCHEMA: &str = "
message dns_session_block {
    OPTIONAL BYTE_ARRAY label0 (UTF8);
    OPTIONAL BYTE_ARRAY label1 (UTF8);
    OPTIONAL BYTE_ARRAY label2 (UTF8);
    OPTIONAL BYTE_ARRAY label3 (UTF8);
    OPTIONAL BYTE_ARRAY label4 (UTF8);
    OPTIONAL BYTE_ARRAY label5 (UTF8);
    OPTIONAL BYTE_ARRAY label6 (UTF8);
    OPTIONAL BYTE_ARRAY label7 (UTF8);
    OPTIONAL BYTE_ARRAY label8 (UTF8);
    OPTIONAL BYTE_ARRAY label9 (UTF8);
    OPTIONAL BYTE_ARRAY server_id;
    OPTIONAL INT64 query_time (TIMESTAMP_MICROS);
    OPTIONAL INT64 response_time (TIMESTAMP_MICROS);
    OPTIONAL INT32 source_ipv4;
    OPTIONAL INT32 dest_ipv4;
    OPTIONAL INT64 source_ipv6_network;
    OPTIONAL INT64 source_ipv6_host;
    OPTIONAL INT64 dest_ipv6_network;
    OPTIONAL INT64 dest_ipv6_host;
    OPTIONAL INT32 source_port;
    OPTIONAL INT32 dest_port;
    OPTIONAL INT32 dns_protocol;
    OPTIONAL BYTE_ARRAY query_message;
    OPTIONAL BYTE_ARRAY response_message;
}
";

const HISTOGRAM_SCHEMA: &str = "
message dns_histogram {
    REQUIRED INT64 start_time (TIMESTAMP_MICROS);
    OPTIONAL BYTE_ARRAY label0 (UTF8);
    OPTIONAL BYTE_ARRAY label1 (UTF8);
    OPTIONAL BYTE_ARRAY label2 (UTF8);
    OPTIONAL BYTE_ARRAY label3 (UTF8);
    OPTIONAL BYTE_ARRAY label4 (UTF8);
    OPTIONAL BYTE_ARRAY label5 (UTF8);
    OPTIONAL BYTE_ARRAY label6 (UTF8);
    OPTIONAL BYTE_ARRAY label7 (UTF8);
    OPTIONAL BYTE_ARRAY label8 (UTF8);
    OPTIONAL BYTE_ARRAY label9 (UTF8);
    REQUIRED INT64 a_count;
    REQUIRED INT64 aaaa_count;
    REQUIRED INT64 mx_count;
    REQUIRED INT64 ns_count;
    REQUIRED INT64 other_type_count;
    REQUIRED INT64 non_in_count;
    REQUIRED INT64 ok_count;
    REQUIRED INT64 nx_count;
    REQUIRED INT64 fail_count;
    REQUIRED INT64 other_rcode_count;
    REQUIRED INT64 status_bits;
    OPTIONAL BYTE_ARRAY v4client_count;
    OPTIONAL BYTE_ARRAY v6client_count;
}
";

////////////////////////////////////////////////////////////////////////
// WRITER LOOPS                                                       //
////////////////////////////////////////////////////////////////////////

/// Consumes session batches until the channel closes.
pub fn run_session_writer(batches: Receiver<SessionBatch>, data_dir: PathBuf) {
    info!("session writer starting");
    let sessions_dir = data_dir.join("parquet").join("sessions");
    for batch in batches.iter() {
        if let Err(err) = write_session_file(batch, &sessions_dir) {
            error!("session writer: {}", err);
        }
    }
    info!("session writer exiting");
}

/// Consumes histogram snapshots until the channel closes.
pub fn run_histogram_writer(snapshots: Receiver<Snapshot>, outbox_dir: PathBuf) {
    info!("histogram writer starting");
    for snapshot in snapshots.iter() {
        if let Err(err) = write_histogram_file(snapshot, &outbox_dir) {
            error!("histogram writer: {}", err);
        }
    }
    info!("histogram writer exiting");
}

////////////////////////////////////////////////////////////////////////
// SESSION FILES                                                      //
////////////////////////////////////////////////////////////////////////

/// Writes one session batch into `sessions_dir`.
pub fn write_session_file(batch: SessionBatch, sessions_dir: &Path) -> Result<(), Error> {
    let start = window_start(batch.rotation_time);
    let (file, pending) =
        PendingFile::create(sessions_dir, SESSION_BASE, start, batch.rotation_time)?;
    info!("writing session file {}", pending.tmp.display());

    let schema = Arc::new(parse_message_type(SESSION_SCHEMA)?);
    let props = Arc::new(
        WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build(),
    );
    let mut writer = SerializedFileWriter::new(file, schema, props)?;
    let mut row_group = writer.next_row_group()?;

    let rows = &batch.sessions;
    for slot in 0..LABEL_SLOTS {
        write_opt_bytes(&mut row_group, rows.iter().map(|r| label_bytes(r, slot)))?;
    }
    write_opt_bytes(&mut row_group, rows.iter().map(|r| r.server_id.as_deref()))?;
    write_opt_i64(&mut row_group, rows.iter().map(|r| r.query_time))?;
    write_opt_i64(&mut row_group, rows.iter().map(|r| r.response_time))?;
    write_opt_i32(&mut row_group, rows.iter().map(|r| r.source_ipv4))?;
    write_opt_i32(&mut row_group, rows.iter().map(|r| r.dest_ipv4))?;
    write_opt_i64(&mut row_group, rows.iter().map(|r| r.source_ipv6_network))?;
    write_opt_i64(&mut row_group, rows.iter().map(|r| r.source_ipv6_host))?;
    write_opt_i64(&mut row_group, rows.iter().map(|r| r.dest_ipv6_network))?;
    write_opt_i64(&mut row_group, rows.iter().map(|r| r.dest_ipv6_host))?;
    write_opt_i32(&mut row_group, rows.iter().map(|r| r.source_port))?;
    write_opt_i32(&mut row_group, rows.iter().map(|r| r.dest_port))?;
    write_opt_i32(&mut row_group, rows.iter().map(|r| r.dns_protocol))?;
    write_opt_bytes(&mut row_group, rows.iter().map(|r| r.query_message.as_deref()))?;
    write_opt_bytes(
        &mut row_group,
        rows.iter().map(|r| r.response_message.as_deref()),
    )?;

    row_group.close()?;
    writer.close()?;
    pending.commit()?;
    Ok(())
}

fn label_bytes(row: &SessionRow, slot: usize) -> Option<&[u8]> {
    row.labels[slot].as_deref().map(str::as_bytes)
}

////////////////////////////////////////////////////////////////////////
// HISTOGRAM FILES                                                    //
////////////////////////////////////////////////////////////////////////

/// Writes one histogram snapshot into `outbox_dir`.
///
/// Dictionary indices are resolved back to names in one streaming pass
/// over the snapshot's dictionary; if the snapshot carried a rotated
/// dictionary revision, it is released when the snapshot is dropped at
/// the end of this function.
pub fn write_histogram_file(snapshot: Snapshot, outbox_dir: &Path) -> Result<(), Error> {
    let start = window_start(snapshot.rotation_time);
    let start_micros = start.timestamp_micros();

    let indices: HashSet<u64> = snapshot.entries.keys().copied().collect();
    let names = snapshot.dictionary.names_for(&indices);

    // Stable output order keeps repeated runs comparable.
    let mut ordered: Vec<u64> = indices.into_iter().collect();
    ordered.sort_unstable();

    let mut label_rows = Vec::with_capacity(ordered.len());
    let mut sketch_rows = Vec::with_capacity(ordered.len());
    for &index in &ordered {
        let name = names.get(&index).ok_or(Error::UnknownIndex(index))?;
        // Suffix entries are stored dot-prefixed; strip the dot so the
        // label columns carry the bare name.
        let parsed: Name = name
            .trim_start_matches('.')
            .parse()
            .map_err(|_| Error::UnknownIndex(index))?;
        let mut slots: [Option<String>; LABEL_SLOTS] = Default::default();
        for (slot, label) in slots
            .iter_mut()
            .zip(parsed.reverse_labels_bounded(LABEL_SLOTS))
        {
            *slot = Some(label);
        }
        label_rows.push(slots);

        let entry = &snapshot.entries[&index];
        sketch_rows.push((entry.v4_clients.to_bytes(), entry.v6_clients.to_bytes()));
    }

    let (file, pending) =
        PendingFile::create(outbox_dir, HISTOGRAM_BASE, start, snapshot.rotation_time)?;
    info!("writing histogram file {}", pending.tmp.display());

    let schema = Arc::new(parse_message_type(HISTOGRAM_SCHEMA)?);
    let props = Arc::new(
        WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build(),
    );
    let mut writer = SerializedFileWriter::new(file, schema, props)?;
    let mut row_group = writer.next_row_group()?;

    write_req_i64(&mut row_group, ordered.iter().map(|_| start_micros))?;
    for slot in 0..LABEL_SLOTS {
        write_opt_bytes(
            &mut row_group,
            label_rows
                .iter()
                .map(|labels| labels[slot].as_deref().map(str::as_bytes)),
        )?;
    }

    let entries: Vec<&crate::collector::HistogramEntry> =
        ordered.iter().map(|index| &snapshot.entries[index]).collect();
    write_req_i64(&mut row_group, entries.iter().map(|e| e.counters.a as i64))?;
    write_req_i64(&mut row_group, entries.iter().map(|e| e.counters.aaaa as i64))?;
    write_req_i64(&mut row_group, entries.iter().map(|e| e.counters.mx as i64))?;
    write_req_i64(&mut row_group, entries.iter().map(|e| e.counters.ns as i64))?;
    write_req_i64(
        &mut row_group,
        entries.iter().map(|e| e.counters.other_type as i64),
    )?;
    write_req_i64(
        &mut row_group,
        entries.iter().map(|e| e.counters.non_in as i64),
    )?;
    write_req_i64(&mut row_group, entries.iter().map(|e| e.counters.ok as i64))?;
    write_req_i64(&mut row_group, entries.iter().map(|e| e.counters.nx as i64))?;
    write_req_i64(&mut row_group, entries.iter().map(|e| e.counters.fail as i64))?;
    write_req_i64(
        &mut row_group,
        entries.iter().map(|e| e.counters.other_rcode as i64),
    )?;
    write_req_i64(&mut row_group, entries.iter().map(|e| e.status_bits as i64))?;
    write_opt_bytes(
        &mut row_group,
        sketch_rows.iter().map(|(v4, _)| Some(v4.as_slice())),
    )?;
    write_opt_bytes(
        &mut row_group,
        sketch_rows.iter().map(|(_, v6)| Some(v6.as_slice())),
    )?;

    row_group.close()?;
    writer.close()?;
    pending.commit()?;

    if snapshot.dictionary_rotated {
        info!("releasing the rotated dictionary revision");
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////
// COLUMN HELPERS                                                     //
////////////////////////////////////////////////////////////////////////

fn next_column<'a, W: io::Write + Send>(
    row_group: &'a mut SerializedRowGroupWriter<'_, W>,
) -> Result<parquet::file::writer::SerializedColumnWriter<'a>, Error> {
    row_group.next_column()?.ok_or(Error::SchemaMismatch)
}

fn write_req_i64<W: io::Write + Send>(
    row_group: &mut SerializedRowGroupWriter<'_, W>,
    values: impl Iterator<Item = i64>,
) -> Result<(), Error> {
    let values: Vec<i64> = values.collect();
    let mut column = next_column(row_group)?;
    column
        .typed::<Int64Type>()
        .write_batch(&values, None, None)?;
    column.close()?;
    Ok(())
}

fn write_opt_i64<W: io::Write + Send>(
    row_group: &mut SerializedRowGroupWriter<'_, W>,
    values: impl Iterator<Item = Option<i64>>,
) -> Result<(), Error> {
    let mut def_levels = Vec::new();
    let mut present = Vec::new();
    for value in values {
        def_levels.push(i16::from(value.is_some()));
        if let Some(value) = value {
            present.push(value);
        }
    }
    let mut column = next_column(row_group)?;
    column
        .typed::<Int64Type>()
        .write_batch(&present, Some(&def_levels), None)?;
    column.close()?;
    Ok(())
}

fn write_opt_i32<W: io::Write + Send>(
    row_group: &mut SerializedRowGroupWriter<'_, W>,
    values: impl Iterator<Item = Option<i32>>,
) -> Result<(), Error> {
    let mut def_levels = Vec::new();
    let mut present = Vec::new();
    for value in values {
        def_levels.push(i16::from(value.is_some()));
        if let Some(value) = value {
            present.push(value);
        }
    }
    let mut column = next_column(row_group)?;
    column
        .typed::<Int32Type>()
        .write_batch(&present, Some(&def_levels), None)?;
    column.close()?;
    Ok(())
}

fn write_opt_bytes<'a, W: io::Write + Send>(
    row_group: &mut SerializedRowGroupWriter<'_, W>,
    values: impl Iterator<Item = Option<&'a [u8]>>,
) -> Result<(), Error> {
    let mut def_levels = Vec::new();
    let mut present = Vec::new();
    for value in values {
        def_levels.push(i16::from(value.is_some()));
        if let Some(value) = value {
            present.push(ByteArray::from(value.to_vec()));
        }
    }
    let mut column = next_column(row_group)?;
    column
        .typed::<ByteArrayType>()
        .write_batch(&present, Some(&def_levels), None)?;
    column.close()?;
    Ok(())
}

////////////////////////////////////////////////////////////////////////
// FILE LIFECYCLE                                                     //
////////////////////////////////////////////////////////////////////////

/// A freshly created `.tmp` output file. If the `PendingFile` is
/// dropped without [`PendingFile::commit`] having succeeded, the
/// temporary file is removed.
struct PendingFile {
    tmp: PathBuf,
    dest: PathBuf,
    committed: bool,
}

impl PendingFile {
    fn create(
        dir: &Path,
        base: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<(File, Self), Error> {
        let (tmp, dest) = parquet_file_names(dir, base, start, stop);
        let file = create_file(&tmp)?;
        Ok((
            file,
            Self {
                tmp,
                dest,
                committed: false,
            },
        ))
    }

    /// Renames the temporary file to its final name, making it visible
    /// to consumers.
    fn commit(mut self) -> Result<(), Error> {
        rename_file(&self.tmp, &self.dest)?;
        info!("renamed {} to {}", self.tmp.display(), self.dest.display());
        self.committed = true;
        Ok(())
    }
}

impl Drop for PendingFile {
    fn drop(&mut self) {
        if !self.committed {
            info!("removing {} after a failed write", self.tmp.display());
            if let Err(err) = fs::remove_file(&self.tmp) {
                error!("unable to remove {}: {}", self.tmp.display(), err);
            }
        }
    }
}

/// Creates `path`, creating its parent directory first if it does not
/// exist yet.
pub fn create_file(path: &Path) -> Result<File, Error> {
    match File::create(path) {
        Ok(file) => Ok(file),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            create_parent(path)?;
            File::create(path).map_err(Error::Io)
        }
        Err(err) => Err(Error::Io(err)),
    }
}

/// Renames `src` to `dst`, creating the destination directory first if
/// it does not exist yet.
pub fn rename_file(src: &Path, dst: &Path) -> Result<(), Error> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            create_parent(dst)?;
            fs::rename(src, dst).map_err(Error::Io)
        }
        Err(err) => Err(Error::Io(err)),
    }
}

fn create_parent(path: &Path) -> Result<(), Error> {
    let dir = path.parent().ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "the path has no parent directory",
        ))
    })?;
    fs::create_dir_all(dir).map_err(Error::Io)?;
    info!("created directory {}", dir.display());
    Ok(())
}

////////////////////////////////////////////////////////////////////////
// FILE NAMES                                                         //
////////////////////////////////////////////////////////////////////////

/// Returns the temporary and final path of an output file for the
/// window `[start, stop]`.
pub fn parquet_file_names(
    dir: &Path,
    base: &str,
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
) -> (PathBuf, PathBuf) {
    let name = format!(
        "{}-{}_{}.parquet",
        base,
        file_timestamp(start),
        file_timestamp(stop),
    );
    (dir.join(format!("{}.tmp", name)), dir.join(name))
}

/// Formats a timestamp for a file name: RFC 3339 UTC with colons
/// replaced by dashes.
fn file_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true).replace(':', "-")
}

/// Parses the start and stop timestamps back out of an output file
/// name.
pub fn timestamps_from_file_name(name: &str) -> Result<(DateTime<Utc>, DateTime<Utc>), Error> {
    let bad = || Error::BadFileName(name.to_owned());
    let trimmed = name.strip_suffix(".parquet").ok_or_else(bad)?;
    let (_, timestamps) = trimmed.split_once('-').ok_or_else(bad)?;
    let (start, stop) = timestamps.split_once('_').ok_or_else(bad)?;
    let parse = |s: &str| {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H-%M-%SZ")
            .map(|naive| naive.and_utc())
            .map_err(|_| bad())
    };
    Ok((parse(start)?, parse(stop)?))
}

/// Returns whether `name` looks like a (final, non-temporary) histogram
/// file name.
pub fn is_histogram_file_name(name: &str) -> bool {
    name.starts_with("dns_histogram-") && name.ends_with(".parquet")
}

/// Returns the window start for a rotation timestamp. Windows are one
/// minute long; the very first window after startup is simply treated
/// as full.
pub fn window_start(rotation_time: DateTime<Utc>) -> DateTime<Utc> {
    rotation_time - chrono::Duration::seconds(60)
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error type for output file writing.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Parquet(ParquetError),

    /// A histogram index was missing from the snapshot's dictionary.
    UnknownIndex(u64),

    /// An output file name did not match the expected pattern.
    BadFileName(String),

    /// The writer produced more columns than the schema declares.
    SchemaMismatch,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ParquetError> for Error {
    fn from(err: ParquetError) -> Self {
        Self::Parquet(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {}", err),
            Self::Parquet(err) => write!(f, "parquet error: {}", err),
            Self::UnknownIndex(index) => {
                write!(f, "index {} is not in the snapshot's dictionary", index)
            }
            Self::BadFileName(name) => write!(f, "unexpected output file name '{}'", name),
            Self::SchemaMismatch => f.write_str("column count does not match the schema"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use parquet::record::RowAccessor;

    use super::*;
    use crate::collector::Collector;
    use crate::dictionary::{write_dictionary_file, Dictionary};
    use crate::message::{Qclass, Qtype, Question, Rcode};
    use crate::tracker::{DomainTracker, Update};

    fn rotation_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 11, 29, 13, 51, 0).unwrap()
    }

    #[test]
    fn file_names_round_trip() {
        let start = Utc.with_ymd_and_hms(2023, 11, 29, 13, 50, 0).unwrap();
        let stop = rotation_time();
        let (tmp, dest) = parquet_file_names(Path::new("/out"), HISTOGRAM_BASE, start, stop);
        assert_eq!(
            dest,
            Path::new(
                "/out/dns_histogram-2023-11-29T13-50-00Z_2023-11-29T13-51-00Z.parquet"
            ),
        );
        assert_eq!(tmp.extension().unwrap(), "tmp");

        let name = dest.file_name().unwrap().to_str().unwrap();
        assert!(is_histogram_file_name(name));
        let (parsed_start, parsed_stop) = timestamps_from_file_name(name).unwrap();
        assert_eq!(parsed_start, start);
        assert_eq!(parsed_stop, stop);
    }

    #[test]
    fn bad_file_names_are_rejected() {
        assert!(timestamps_from_file_name("nonsense").is_err());
        assert!(timestamps_from_file_name("dns_histogram-a_b.parquet").is_err());
        assert!(!is_histogram_file_name(
            "dns_histogram-2023-11-29T13-50-00Z_2023-11-29T13-51-00Z.parquet.tmp"
        ));
    }

    #[test]
    fn session_files_are_written_and_renamed() {
        let dir = tempfile::tempdir().unwrap();
        let sessions_dir = dir.path().join("parquet").join("sessions");

        let row = SessionRow {
            labels: {
                let mut labels: [Option<String>; LABEL_SLOTS] = Default::default();
                labels[0] = Some("com".to_owned());
                labels[1] = Some("example".to_owned());
                labels
            },
            response_time: Some(1_700_000_000_000_000),
            source_ipv4: Some(0x7f000001u32 as i32),
            dest_port: Some(53),
            dns_protocol: Some(1),
            response_message: Some(vec![1, 2, 3]),
            ..SessionRow::default()
        };
        let batch = SessionBatch {
            sessions: vec![row, SessionRow::default()],
            rotation_time: rotation_time(),
        };
        write_session_file(batch, &sessions_dir).unwrap();

        // The directory was created on demand; the only file there is
        // the renamed final file.
        let entries: Vec<_> = fs::read_dir(&sessions_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].starts_with("dns_session_block-"));
        assert!(entries[0].ends_with(".parquet"));

        let file = File::open(sessions_dir.join(&entries[0])).unwrap();
        let reader = SerializedFileReader::new(file).unwrap();
        assert_eq!(reader.metadata().file_metadata().num_rows(), 2);
    }

    #[test]
    fn histogram_files_carry_labels_counters_and_sketches() {
        let dir = tempfile::tempdir().unwrap();
        let dict_path = dir.path().join("domains.fst");
        write_dictionary_file(&dict_path, &[(".known.example.", 7)]);
        let dictionary = Dictionary::load(&dict_path).unwrap();
        let tracker = Arc::new(DomainTracker::new(dictionary, dict_path));
        let mut collector = Collector::new(tracker.clone());

        let name: Name = "www.known.example.".parse().unwrap();
        let hit = tracker.lookup(&name).unwrap();
        let question = Question {
            name,
            qtype: Qtype::A,
            qclass: Qclass::IN,
        };
        collector.handle_update(
            Update::new(hit, &question, Rcode::NoError, Some(&[192, 0, 2, 7])),
            None,
        );
        let (_, snapshot) = collector.rotate(rotation_time());
        let snapshot = snapshot.unwrap().unwrap();

        let outbox = dir.path().join("outbox");
        write_histogram_file(snapshot, &outbox).unwrap();

        let entries: Vec<_> = fs::read_dir(&outbox)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries.len(), 1);
        assert!(is_histogram_file_name(&entries[0]));

        let file = File::open(outbox.join(&entries[0])).unwrap();
        let reader = SerializedFileReader::new(file).unwrap();
        assert_eq!(reader.metadata().file_metadata().num_rows(), 1);

        let row = reader.get_row_iter(None).unwrap().next().unwrap().unwrap();
        // Columns: start_time, label0..9, then the counters.
        assert_eq!(
            row.get_timestamp_micros(0).unwrap(),
            window_start(rotation_time()).timestamp_micros(),
        );
        assert_eq!(row.get_string(1).unwrap().as_str(), "example");
        assert_eq!(row.get_string(2).unwrap().as_str(), "known");
        assert!(row.get_string(3).is_err()); // label2 is null
        assert_eq!(row.get_long(11).unwrap(), 1); // a_count
        assert_eq!(row.get_long(17).unwrap(), 1); // ok_count
        assert_eq!(
            row.get_long(21).unwrap(),
            crate::collector::STATUS_WELL_KNOWN_WILDCARD as i64,
        );
        assert!(!row.get_bytes(22).unwrap().data().is_empty());
    }

    #[test]
    fn failed_writes_leave_no_temporary_file() {
        let dir = tempfile::tempdir().unwrap();
        let (file, pending) = PendingFile::create(
            dir.path(),
            SESSION_BASE,
            window_start(rotation_time()),
            rotation_time(),
        )
        .unwrap();
        drop(file);
        let tmp = pending.tmp.clone();
        assert!(tmp.exists());

        // Dropping without a commit removes the temporary file.
        drop(pending);
        assert!(!tmp.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
