//! Append-only raw epoch stream.
//!
//! The file is a plain sequence of records, one per epoch, each holding
//! `num_channels * epoch_samples` little-endian `f32` values in channel-major
//! order (all samples of channel 0, then channel 1, ...). There is no header:
//! the epoch count is `file_size / record_bytes`.

use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

const SAMPLE_BYTES: u64 = 4;
const WRITE_BUFFER_BYTES: usize = 1 << 16;

pub fn record_bytes(num_channels: usize, epoch_samples: usize) -> u64 {
    (num_channels * epoch_samples) as u64 * SAMPLE_BYTES
}

/// Number of whole records in an existing stream.
pub fn count_records<P: AsRef<Path>>(path: P, num_channels: usize, epoch_samples: usize) -> Result<usize> {
    let record = record_bytes(num_channels, epoch_samples);
    if record == 0 {
        return Err(Error::Configuration("empty epoch record".into()));
    }
    let size = std::fs::metadata(path.as_ref())?.len();
    if size % record != 0 {
        return Err(Error::DataConsistency(format!(
            "{} is {} bytes, not a multiple of the {} byte epoch record",
            path.as_ref().display(),
            size,
            record
        )));
    }
    Ok((size / record) as usize)
}

// ---- Writer ----

pub struct RawEpochWriter {
    writer: BufWriter<File>,
    record_len: usize,
    records_written: usize,
}

impl RawEpochWriter {
    /// Opens a fresh stream, truncating any previous content.
    pub fn create<P: AsRef<Path>>(path: P, num_channels: usize, epoch_samples: usize) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::with_capacity(WRITE_BUFFER_BYTES, file),
            record_len: num_channels * epoch_samples,
            records_written: 0,
        })
    }

    /// Reopens an existing stream positioned at its end.
    pub fn append<P: AsRef<Path>>(path: P, num_channels: usize, epoch_samples: usize) -> Result<Self> {
        let existing = count_records(path.as_ref(), num_channels, epoch_samples)?;
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::with_capacity(WRITE_BUFFER_BYTES, file),
            record_len: num_channels * epoch_samples,
            records_written: existing,
        })
    }

    /// Writes one full epoch record. Does not allocate.
    pub fn write_record(&mut self, samples: &[f32]) -> io::Result<()> {
        if samples.len() != self.record_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "epoch record has the wrong length",
            ));
        }
        for sample in samples {
            self.writer.write_all(&sample.to_le_bytes())?;
        }
        self.records_written += 1;
        Ok(())
    }

    /// Total records in the stream, including those present before an append.
    pub fn records_written(&self) -> usize {
        self.records_written
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }
}

// ---- Reader ----

pub struct RawEpochReader {
    reader: BufReader<File>,
    record_len: usize,
    num_records: usize,
    bytes: Vec<u8>,
}

impl RawEpochReader {
    pub fn open<P: AsRef<Path>>(path: P, num_channels: usize, epoch_samples: usize) -> Result<Self> {
        let num_records = count_records(path.as_ref(), num_channels, epoch_samples)?;
        let file = File::open(path)?;
        let record_len = num_channels * epoch_samples;
        Ok(Self {
            reader: BufReader::new(file),
            record_len,
            num_records,
            bytes: vec![0u8; record_len * SAMPLE_BYTES as usize],
        })
    }

    pub fn num_records(&self) -> usize {
        self.num_records
    }

    /// Reads the next record, `None` at end of stream.
    pub fn read_record(&mut self) -> Result<Option<Vec<f32>>> {
        match self.reader.read_exact(&mut self.bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let mut samples = Vec::with_capacity(self.record_len);
        samples.extend(
            self.bytes
                .chunks_exact(SAMPLE_BYTES as usize)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        );
        Ok(Some(samples))
    }

    /// Reads record `index` regardless of the current position.
    pub fn read_record_at(&mut self, index: usize) -> Result<Vec<f32>> {
        if index >= self.num_records {
            return Err(Error::EpochNotFound(index));
        }
        let offset = index as u64 * self.record_len as u64 * SAMPLE_BYTES;
        self.reader.seek(SeekFrom::Start(offset))?;
        self.read_record()?.ok_or(Error::EpochNotFound(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("spike_epochs_raw_{}_{}.bin", name, std::process::id()))
    }

    #[test]
    fn write_then_read_is_bit_exact() {
        let path = temp_path("exact");
        let records = vec![
            vec![0.1f32, -0.25, f32::MIN_POSITIVE, 3.5, 1e-7, -2.0],
            vec![7.0f32, 6.0, 5.0, 4.0, 3.0, 2.0],
        ];
        let mut writer = RawEpochWriter::create(&path, 2, 3).unwrap();
        for record in &records {
            writer.write_record(record).unwrap();
        }
        writer.flush().unwrap();
        drop(writer);

        let mut reader = RawEpochReader::open(&path, 2, 3).unwrap();
        assert_eq!(reader.num_records(), 2);
        for record in &records {
            let read = reader.read_record().unwrap().unwrap();
            let bits: Vec<u32> = read.iter().map(|s| s.to_bits()).collect();
            let expected: Vec<u32> = record.iter().map(|s| s.to_bits()).collect();
            assert_eq!(bits, expected);
        }
        assert!(reader.read_record().unwrap().is_none());

        assert_eq!(reader.read_record_at(0).unwrap(), records[0]);
        assert!(matches!(reader.read_record_at(2), Err(Error::EpochNotFound(2))));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn append_continues_after_existing_records() {
        let path = temp_path("append");
        let mut writer = RawEpochWriter::create(&path, 1, 4).unwrap();
        writer.write_record(&[1.0; 4]).unwrap();
        writer.flush().unwrap();
        drop(writer);

        let mut writer = RawEpochWriter::append(&path, 1, 4).unwrap();
        assert_eq!(writer.records_written(), 1);
        writer.write_record(&[2.0; 4]).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.records_written(), 2);
        drop(writer);

        assert_eq!(count_records(&path, 1, 4).unwrap(), 2);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn partial_record_is_a_consistency_error() {
        let path = temp_path("partial");
        std::fs::write(&path, [0u8; 10]).unwrap();
        assert!(matches!(
            count_records(&path, 1, 2),
            Err(Error::DataConsistency(_))
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn wrong_record_length_is_rejected() {
        let path = temp_path("len");
        let mut writer = RawEpochWriter::create(&path, 2, 2).unwrap();
        assert!(writer.write_record(&[0.0; 3]).is_err());
        assert_eq!(writer.records_written(), 0);
        std::fs::remove_file(&path).ok();
    }
}
