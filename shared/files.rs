use flate2::read::MultiGzDecoder;
use log::debug;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// A trait that abstracts sequential, line-oriented access to tabular text
/// inputs such as genotype tables and gene interval references, regardless of
/// whether the file on disk is compressed.
pub trait TextSource: Send {
    fn len(&self) -> Option<u64> {
        None
    }

    fn next_line<'a>(&'a mut self) -> io::Result<Option<&'a [u8]>>;
}

/// Opens `path` for line-by-line reading. Gzip and BGZF inputs are detected
/// from their magic bytes, not from the file extension.
pub fn open_text_source(path: &Path) -> io::Result<Box<dyn TextSource>> {
    let mut file = File::open(path).map_err(|e| with_context(e, "Opening", path))?;
    let len = file
        .metadata()
        .map_err(|e| with_context(e, "Metadata for", path))?
        .len();

    let mut magic = [0u8; 2];
    let bytes_read = read_magic(&mut file, &mut magic).map_err(|e| with_context(e, "Reading", path))?;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| with_context(e, "Seeking", path))?;

    let path_display = path.display().to_string();
    if bytes_read == 2 && is_gzip_magic(&magic) {
        debug!("Reading {path_display} through a gzip decoder");
        let reader: Box<dyn BufRead + Send> = Box::new(BufReader::new(MultiGzDecoder::new(file)));
        Ok(Box::new(LocalTextSource::new(reader, None, path_display)))
    } else {
        let reader: Box<dyn BufRead + Send> = Box::new(BufReader::new(file));
        Ok(Box::new(LocalTextSource::new(reader, Some(len), path_display)))
    }
}

fn read_magic(file: &mut File, magic: &mut [u8; 2]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < magic.len() {
        let read = file.read(&mut magic[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

fn is_gzip_magic(magic: &[u8; 2]) -> bool {
    magic[0] == 0x1F && magic[1] == 0x8B
}

fn with_context(err: io::Error, action: &str, path: &Path) -> io::Error {
    io::Error::new(err.kind(), format!("{action} {}: {err}", path.display()))
}

struct LocalTextSource {
    reader: Box<dyn BufRead + Send>,
    line: Vec<u8>,
    line_active: bool,
    len: Option<u64>,
    path_display: String,
}

impl LocalTextSource {
    fn new(reader: Box<dyn BufRead + Send>, len: Option<u64>, path_display: String) -> Self {
        Self {
            reader,
            line: Vec::with_capacity(1024),
            line_active: false,
            len,
            path_display,
        }
    }
}

impl TextSource for LocalTextSource {
    fn len(&self) -> Option<u64> {
        self.len
    }

    fn next_line<'a>(&'a mut self) -> io::Result<Option<&'a [u8]>> {
        if self.line_active {
            self.line.clear();
            self.line_active = false;
        }

        let bytes_read = self.reader.read_until(b'\n', &mut self.line).map_err(|e| {
            io::Error::new(e.kind(), format!("Error reading {}: {e}", self.path_display))
        })?;

        if bytes_read == 0 {
            return Ok(None);
        }

        if self.line.last() == Some(&b'\n') {
            self.line.pop();
        }
        if self.line.last() == Some(&b'\r') {
            self.line.pop();
        }

        self.line_active = true;
        Ok(Some(&self.line))
    }
}
