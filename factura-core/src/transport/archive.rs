//! Single-entry zip archives exchanged with billService.
use std::io::{Cursor, Read, Write};
use thiserror::Error;
use zip::{
    CompressionMethod, ZipArchive, ZipWriter, result::ZipError, write::SimpleFileOptions,
};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("zip error: {0}")]
    Zip(#[from] ZipError),
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive has no .xml entry")]
    NoXmlEntry,
}

/// Entry read back from an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Deflate `bytes` as the only entry of a new archive.
///
/// Entries carry the zip epoch timestamp, so equal input gives equal output.
pub fn zip_single(entry_name: &str, bytes: &[u8]) -> Result<Vec<u8>, ArchiveError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::with_capacity(bytes.len() / 2)));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    writer.start_file(entry_name, options)?;
    writer.write_all(bytes)?;
    Ok(writer.finish()?.into_inner())
}

/// First entry whose name ends in `.xml`, compared case-insensitively.
pub fn read_first_xml(archive: &[u8]) -> Result<ArchiveEntry, ArchiveError> {
    let mut archive = ZipArchive::new(Cursor::new(archive))?;
    for idx in 0..archive.len() {
        let mut file = archive.by_index(idx)?;
        if file.is_dir() || !file.name().to_ascii_lowercase().ends_with(".xml") {
            continue;
        }
        let name = file.name().to_string();
        let mut bytes = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut bytes)?;
        return Ok(ArchiveEntry { name, bytes });
    }
    Err(ArchiveError::NoXmlEntry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_entry_round_trips() {
        let zipped = zip_single("20601546913-01-F001-1.xml", b"<Invoice/>").expect("zip");
        let entry = read_first_xml(&zipped).expect("read");
        assert_eq!(entry.name, "20601546913-01-F001-1.xml");
        assert_eq!(entry.bytes, b"<Invoice/>");
    }

    #[test]
    fn output_is_deterministic() {
        let first = zip_single("a.xml", b"<a>same</a>").expect("zip");
        let second = zip_single("a.xml", b"<a>same</a>").expect("zip");
        assert_eq!(first, second);
    }

    #[test]
    fn picks_first_xml_entry_case_insensitively() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        writer.add_directory("dummy/", options).expect("dir");
        writer.start_file("readme.txt", options).expect("txt");
        writer.write_all(b"not xml").expect("write");
        writer.start_file("R-20601546913-01-F001-1.XML", options).expect("xml");
        writer.write_all(b"<ok/>").expect("write");
        writer.start_file("second.xml", options).expect("xml");
        writer.write_all(b"<second/>").expect("write");
        let bytes = writer.finish().expect("finish").into_inner();

        let entry = read_first_xml(&bytes).expect("entry");
        assert_eq!(entry.name, "R-20601546913-01-F001-1.XML");
        assert_eq!(entry.bytes, b"<ok/>");
    }

    #[test]
    fn missing_xml_entry_and_garbage_are_distinct() {
        let zipped = zip_single("notes.txt", b"hello").expect("zip");
        assert!(matches!(read_first_xml(&zipped), Err(ArchiveError::NoXmlEntry)));
        assert!(matches!(read_first_xml(b"not a zip"), Err(ArchiveError::Zip(_))));
    }
}
