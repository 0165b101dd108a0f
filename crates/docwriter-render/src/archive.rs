use std::io::{Cursor, Write};

use zip::write::FileOptions;
use zip::ZipWriter;

use crate::RenderError;

/// Bundle named artifacts into a zip archive, entries in the given order.
pub fn bundle_archive(entries: &[(String, Vec<u8>)]) -> Result<Vec<u8>, RenderError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default();
    for (name, bytes) in entries {
        writer
            .start_file(name.as_str(), options)
            .map_err(|err| RenderError::Archive(format!("start entry '{}': {}", name, err)))?;
        writer
            .write_all(bytes)
            .map_err(|err| RenderError::Archive(format!("write entry '{}': {}", name, err)))?;
    }
    let cursor = writer
        .finish()
        .map_err(|err| RenderError::Archive(err.to_string()))?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use zip::ZipArchive;

    #[test]
    fn archives_round_trip_their_entries() {
        let entries = vec![
            ("flow.png".to_string(), b"png-bytes".to_vec()),
            ("flow.puml".to_string(), b"@startuml\n@enduml".to_vec()),
        ];
        let bytes = bundle_archive(&entries).expect("bundle");

        let mut archive = ZipArchive::new(Cursor::new(bytes)).expect("open");
        assert_eq!(archive.len(), 2);
        let mut content = Vec::new();
        archive
            .by_name("flow.png")
            .expect("entry")
            .read_to_end(&mut content)
            .expect("read");
        assert_eq!(content, b"png-bytes");
    }

    #[test]
    fn empty_archive_is_valid() {
        let bytes = bundle_archive(&[]).expect("bundle");
        let archive = ZipArchive::new(Cursor::new(bytes)).expect("open");
        assert_eq!(archive.len(), 0);
    }
}
