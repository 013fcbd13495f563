//! Collecting the files for a job.

use crate::prelude::*;

/// The MIME type `infer` reports for PDFs.
const PDF_MIME_TYPE: &str = "application/pdf";

/// Check that `path` looks like a PDF we could hand to the engine.
pub fn validate_pdf_file(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(anyhow!("file does not exist"));
    }
    let is_pdf_name = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
    if !is_pdf_name {
        return Err(anyhow!("file is not a PDF"));
    }
    let size = path
        .metadata()
        .with_context(|| format!("error reading {:?}", path.display()))?
        .len();
    if size == 0 {
        return Err(anyhow!("PDF file is empty"));
    }
    let kind = infer::get_from_path(path)
        .with_context(|| format!("error reading {:?}", path.display()))?;
    match kind {
        Some(kind) if kind.mime_type() == PDF_MIME_TYPE => Ok(()),
        _ => Err(anyhow!("invalid PDF file format")),
    }
}

/// The ordered list of files for a job. Duplicates are rejected by path
/// equality.
#[derive(Clone, Debug, Default)]
pub struct FileList {
    files: Vec<PathBuf>,
}

impl FileList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file. Returns `false` if it was already present.
    pub fn add(&mut self, path: PathBuf) -> bool {
        if self.files.contains(&path) {
            debug!(path = %path.display(), "Skipping duplicate file");
            false
        } else {
            self.files.push(path);
            true
        }
    }

    /// Add every valid `*.pdf` file directly inside `dir`, in name order.
    /// Returns the number of files added.
    pub fn add_folder(&mut self, dir: &Path) -> Result<usize> {
        let mut pdfs = std::fs::read_dir(dir)
            .with_context(|| format!("cannot read directory {:?}", dir.display()))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("cannot read directory {:?}", dir.display()))?
            .into_iter()
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
            })
            .filter(|path| match validate_pdf_file(path) {
                Ok(()) => true,
                Err(err) => {
                    warn!(path = %path.display(), "Skipping file: {:#}", err);
                    false
                }
            })
            .collect::<Vec<_>>();
        pdfs.sort();
        Ok(pdfs.into_iter().filter(|path| self.add(path.clone())).count())
    }

    /// Add a file after validating it, or every PDF in a directory. Invalid
    /// files are logged and skipped. Returns the number of files added.
    pub fn add_path(&mut self, path: &Path) -> Result<usize> {
        if path.is_dir() {
            return self.add_folder(path);
        }
        match validate_pdf_file(path) {
            Ok(()) => Ok(usize::from(self.add(path.to_owned()))),
            Err(err) => {
                warn!(path = %path.display(), "Skipping file: {:#}", err);
                Ok(0)
            }
        }
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Is the list empty?
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Total size of all files, skipping any we can't stat.
    pub fn total_size(&self) -> u64 {
        self.files
            .iter()
            .filter_map(|path| path.metadata().ok())
            .map(|metadata| metadata.len())
            .sum()
    }

    /// Take the files, in the order they were added.
    pub fn into_files(self) -> Vec<PathBuf> {
        self.files
    }
}

/// Format a byte count for humans.
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINY_PDF: &[u8] = b"%PDF-1.4\n%%EOF\n";

    #[test]
    fn duplicates_are_rejected() {
        let mut list = FileList::new();
        assert!(list.add(PathBuf::from("a.pdf")));
        assert!(list.add(PathBuf::from("b.pdf")));
        assert!(!list.add(PathBuf::from("a.pdf")));
        assert_eq!(
            list.into_files(),
            vec![PathBuf::from("a.pdf"), PathBuf::from("b.pdf")]
        );
    }

    #[test]
    fn validation_checks_name_size_and_magic() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let good = dir.path().join("good.PDF");
        std::fs::write(&good, TINY_PDF)?;
        assert!(validate_pdf_file(&good).is_ok());

        let empty = dir.path().join("empty.pdf");
        std::fs::write(&empty, b"")?;
        assert!(validate_pdf_file(&empty).is_err());

        let not_pdf = dir.path().join("notes.txt");
        std::fs::write(&not_pdf, TINY_PDF)?;
        assert!(validate_pdf_file(&not_pdf).is_err());

        let fake = dir.path().join("fake.pdf");
        std::fs::write(&fake, b"hello world")?;
        assert!(validate_pdf_file(&fake).is_err());

        assert!(validate_pdf_file(&dir.path().join("missing.pdf")).is_err());
        Ok(())
    }

    #[test]
    fn folders_add_pdfs_in_name_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for name in ["b.pdf", "a.pdf", "c.txt"] {
            std::fs::write(dir.path().join(name), TINY_PDF)?;
        }
        let mut list = FileList::new();
        assert_eq!(list.add_path(dir.path())?, 2);
        assert_eq!(list.add_path(&dir.path().join("a.pdf"))?, 0);
        assert_eq!(list.len(), 2);
        assert_eq!(list.total_size(), 2 * TINY_PDF.len() as u64);
        assert_eq!(
            list.into_files(),
            vec![dir.path().join("a.pdf"), dir.path().join("b.pdf")]
        );
        Ok(())
    }

    #[test]
    fn file_sizes_are_human_readable() {
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_file_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }
}
