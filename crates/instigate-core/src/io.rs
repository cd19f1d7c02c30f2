use crate::error::Result;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Replace `path` with `data` via a sibling tempfile, so a reader never sees
/// a half-written `instance.yaml`. Missing parent directories are created.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_missing_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/home/instance.yaml");
        atomic_write(&path, b"storage: {}\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "storage: {}\n");
    }

    #[test]
    fn overwrites_and_leaves_no_tempfiles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("instance.yaml");
        atomic_write(&path, b"a: 1\n").unwrap();
        atomic_write(&path, b"a: 2\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a: 2\n");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
