use flate2::read::GzDecoder;
use std::fs::File;
use std::io;
use std::path::Path;
use tar::Archive;

/// Copy the entry named `entry_name` out of a `.tar.gz` into `dest`.
///
/// Entries match on their file name only, so `./atx-agent` and
/// `dist/atx-agent` both match `atx-agent`.
pub fn extract_entry(archive_path: &Path, entry_name: &str, dest: &Path) -> io::Result<()> {
    let mut archive = Archive::new(GzDecoder::new(File::open(archive_path)?));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let matches = entry
            .path()?
            .file_name()
            .is_some_and(|name| name == entry_name);
        if matches && entry.header().entry_type().is_file() {
            let mut out = File::create(dest)?;
            io::copy(&mut entry, &mut out)?;
            return Ok(());
        }
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("{entry_name} not found in {}", archive_path.display()),
    ))
}
