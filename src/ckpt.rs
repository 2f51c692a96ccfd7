//! Torch checkpoint container writing.
//!
//! Produces the standard torch zip layout so the output loads both in
//! PyTorch and back through candle's pickle reader:
//!
//! ```text
//! archive/data.pkl     pickle protocol 2 object graph
//! archive/data/<n>     one raw little-endian buffer per tensor storage
//! archive/version      "3"
//! ```
//!
//! Each tensor in the pickle stream is a `torch._utils._rebuild_tensor_v2`
//! reduce over a persistent storage tuple
//! `("storage", torch.<T>Storage, "<n>", "cpu", numel)` with contiguous
//! strides and `requires_grad = False`. Only the protocol-2 opcode subset
//! shared by candle's reader and PyTorch's unpickler is emitted.

use candle_core::{DType, Tensor};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::state_dict::{StateDict, Weight};

const ARCHIVE_DIR: &str = "archive";

// Pickle protocol 2 opcodes.
const PROTO: u8 = 0x80;
const GLOBAL: u8 = b'c';
const BINPERSID: u8 = b'Q';
const BININT: u8 = b'J';
const BININT1: u8 = b'K';
const BININT2: u8 = b'M';
const BINFLOAT: u8 = b'G';
const BINUNICODE: u8 = b'X';
const EMPTY_DICT: u8 = b'}';
const EMPTY_TUPLE: u8 = b')';
const MARK: u8 = b'(';
const TUPLE: u8 = b't';
const REDUCE: u8 = b'R';
const SETITEMS: u8 = b'u';
const NEWFALSE: u8 = 0x89;
const STOP: u8 = b'.';

/// Errors produced while writing a torch checkpoint archive.
#[derive(Debug, thiserror::Error)]
pub enum CkptError {
    #[error("i/o error writing checkpoint archive")]
    Io(#[from] std::io::Error),

    #[error("zip error writing checkpoint archive")]
    Zip(#[from] zip::result::ZipError),

    #[error("dtype {dtype:?} has no torch storage equivalent")]
    UnsupportedDtype { dtype: DType },

    #[error("value {0} does not fit the pickle integer encoding")]
    IntOutOfRange(i64),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

/// Serialize a weight mapping, wrapped as `{"state_dict": mapping}`, into a
/// torch checkpoint archive at `path`.
pub fn write_checkpoint(state_dict: &StateDict, path: &Path) -> Result<(), CkptError> {
    let mut pickler = Pickler::new();
    pickler.wrapped_state_dict(state_dict)?;
    let (data_pkl, storages) = pickler.finish();

    let file = File::create(path)?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    // Storages are already dense numeric data; store them uncompressed so
    // readers can seek straight into them.
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .large_file(true);

    zip.start_file(format!("{ARCHIVE_DIR}/data.pkl"), options)?;
    zip.write_all(&data_pkl)?;
    for (index, storage) in storages.iter().enumerate() {
        zip.start_file(format!("{ARCHIVE_DIR}/data/{index}"), options)?;
        zip.write_all(storage)?;
    }
    zip.start_file(format!("{ARCHIVE_DIR}/version"), options)?;
    zip.write_all(b"3\n")?;

    let mut inner = zip.finish()?;
    inner.flush()?;
    Ok(())
}

/// Minimal pickle protocol 2 emitter.
///
/// Tensor storages are accumulated out-of-band and written as separate zip
/// members; their position in `storages` is the persistent storage key.
struct Pickler {
    buf: Vec<u8>,
    storages: Vec<Vec<u8>>,
}

impl Pickler {
    fn new() -> Self {
        Self {
            buf: vec![PROTO, 2],
            storages: Vec::new(),
        }
    }

    fn finish(mut self) -> (Vec<u8>, Vec<Vec<u8>>) {
        self.buf.push(STOP);
        (self.buf, self.storages)
    }

    fn wrapped_state_dict(&mut self, state_dict: &StateDict) -> Result<(), CkptError> {
        self.buf.push(EMPTY_DICT);
        self.buf.push(MARK);
        self.unicode("state_dict");

        self.buf.push(EMPTY_DICT);
        self.buf.push(MARK);
        for (key, weight) in state_dict {
            self.unicode(key);
            match weight {
                Weight::Tensor(t) => self.tensor(t)?,
                Weight::Int(v) => self.int(*v)?,
                Weight::Float(v) => self.float(*v),
            }
        }
        self.buf.push(SETITEMS);

        self.buf.push(SETITEMS);
        Ok(())
    }

    fn tensor(&mut self, t: &Tensor) -> Result<(), CkptError> {
        let storage_class = storage_class(t.dtype())?;
        let storage_key = self.storages.len().to_string();
        let numel = t.elem_count();

        self.global("torch._utils", "_rebuild_tensor_v2");
        self.buf.push(MARK);

        // arg 0: the storage, addressed through a persistent id.
        self.buf.push(MARK);
        self.unicode("storage");
        self.global("torch", storage_class);
        self.unicode(&storage_key);
        self.unicode("cpu");
        self.int(numel as i64)?;
        self.buf.push(TUPLE);
        self.buf.push(BINPERSID);

        // args 1..3: storage_offset, size, contiguous stride.
        self.int(0)?;
        self.buf.push(MARK);
        for dim in t.dims() {
            self.int(*dim as i64)?;
        }
        self.buf.push(TUPLE);
        self.buf.push(MARK);
        for stride in contiguous_strides(t.dims()) {
            self.int(stride as i64)?;
        }
        self.buf.push(TUPLE);

        // args 4..5: requires_grad, empty backward-hook OrderedDict.
        self.buf.push(NEWFALSE);
        self.global("collections", "OrderedDict");
        self.buf.push(EMPTY_TUPLE);
        self.buf.push(REDUCE);

        self.buf.push(TUPLE);
        self.buf.push(REDUCE);

        self.storages.push(storage_bytes(t)?);
        Ok(())
    }

    fn unicode(&mut self, s: &str) {
        self.buf.push(BINUNICODE);
        self.buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn global(&mut self, module: &str, name: &str) {
        self.buf.push(GLOBAL);
        self.buf.extend_from_slice(module.as_bytes());
        self.buf.push(b'\n');
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(b'\n');
    }

    fn int(&mut self, value: i64) -> Result<(), CkptError> {
        if (0..=0xff).contains(&value) {
            self.buf.push(BININT1);
            self.buf.push(value as u8);
        } else if (0..=0xffff).contains(&value) {
            self.buf.push(BININT2);
            self.buf.extend_from_slice(&(value as u16).to_le_bytes());
        } else if let Ok(value) = i32::try_from(value) {
            self.buf.push(BININT);
            self.buf.extend_from_slice(&value.to_le_bytes());
        } else {
            return Err(CkptError::IntOutOfRange(value));
        }
        Ok(())
    }

    fn float(&mut self, value: f64) {
        self.buf.push(BINFLOAT);
        self.buf.extend_from_slice(&value.to_be_bytes());
    }
}

fn storage_class(dtype: DType) -> Result<&'static str, CkptError> {
    match dtype {
        DType::F32 => Ok("FloatStorage"),
        DType::F64 => Ok("DoubleStorage"),
        DType::F16 => Ok("HalfStorage"),
        DType::BF16 => Ok("BFloat16Storage"),
        DType::I64 => Ok("LongStorage"),
        DType::U8 => Ok("ByteStorage"),
        // torch has no unsigned 32-bit storage; casting silently would
        // corrupt values.
        dtype => Err(CkptError::UnsupportedDtype { dtype }),
    }
}

fn contiguous_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }
    strides
}

fn storage_bytes(t: &Tensor) -> Result<Vec<u8>, CkptError> {
    let flat = t.flatten_all()?;
    let bytes = match t.dtype() {
        DType::F32 => flat
            .to_vec1::<f32>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        DType::F64 => flat
            .to_vec1::<f64>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        DType::F16 => flat
            .to_vec1::<half::f16>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        DType::BF16 => flat
            .to_vec1::<half::bf16>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        DType::I64 => flat
            .to_vec1::<i64>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        DType::U8 => flat.to_vec1::<u8>()?,
        dtype => return Err(CkptError::UnsupportedDtype { dtype }),
    };
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_strides() {
        assert_eq!(contiguous_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(contiguous_strides(&[77]), vec![1]);
        assert_eq!(contiguous_strides(&[]), Vec::<usize>::new());
    }

    #[test]
    fn test_pickle_int_encodings() {
        let mut p = Pickler::new();
        p.int(5).unwrap();
        p.int(300).unwrap();
        p.int(100_000).unwrap();
        assert!(p.int(i64::MAX).is_err());
        let (buf, _) = p.finish();
        // PROTO 2, BININT1 5, BININT2 300, BININT 100000, STOP
        assert_eq!(buf[0..2], [PROTO, 2]);
        assert_eq!(buf[2..4], [BININT1, 5]);
        assert_eq!(buf[4], BININT2);
        assert_eq!(u16::from_le_bytes([buf[5], buf[6]]), 300);
        assert_eq!(buf[7], BININT);
        assert_eq!(
            i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            100_000
        );
        assert_eq!(*buf.last().unwrap(), STOP);
    }

    #[test]
    fn test_stream_is_protocol_two() {
        let mut p = Pickler::new();
        p.wrapped_state_dict(&StateDict::new()).unwrap();
        let (buf, storages) = p.finish();
        assert_eq!(buf[0..2], [PROTO, 2]);
        assert_eq!(*buf.last().unwrap(), STOP);
        assert!(storages.is_empty());
    }
}
