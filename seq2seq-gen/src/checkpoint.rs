//! Named-tensor checkpoint files.
//!
//! Layout (little-endian): magic `S2SG`, `u32` version, `u32` tensor count,
//! then per tensor a `u32` name length, the UTF-8 name, a `u32` rank, `rank`
//! `u32` dimensions and the `f32` data in row-major order.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use bytemuck::cast_slice;
use memmap2::MmapOptions;
use ndarray::{ArrayD, ArrayViewMutD, IxDyn};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{ParamVisitor, Parameters};

const MAGIC: &[u8; 4] = b"S2SG";
const VERSION: u32 = 1;

/// In-memory set of named tensors.
#[derive(Debug, Default)]
pub struct Checkpoint {
    tensors: BTreeMap<String, ArrayD<f32>>,
}

struct Collector<'a>(&'a mut BTreeMap<String, ArrayD<f32>>);

impl ParamVisitor for Collector<'_> {
    fn visit(&mut self, name: &str, param: ArrayViewMutD<'_, f32>) -> Result<()> {
        self.0.insert(name.to_string(), param.to_owned());
        Ok(())
    }
}

struct Assigner<'a> {
    checkpoint: &'a Checkpoint,
    used: BTreeSet<String>,
}

impl ParamVisitor for Assigner<'_> {
    fn visit(&mut self, name: &str, mut param: ArrayViewMutD<'_, f32>) -> Result<()> {
        let tensor = self
            .checkpoint
            .get(name)
            .ok_or_else(|| Error::MissingTensor(name.to_string()))?;
        if tensor.shape() != param.shape() {
            return Err(Error::ShapeMismatch {
                name: name.to_string(),
                expected: param.shape().to_vec(),
                found: tensor.shape().to_vec(),
            });
        }
        param.assign(tensor);
        self.used.insert(name.to_string());
        Ok(())
    }
}

impl Checkpoint {
    /// Snapshot every parameter of `model`.
    pub fn from_model<M: Parameters + ?Sized>(model: &mut M) -> Result<Self> {
        let mut tensors = BTreeMap::new();
        model.visit_params("", &mut Collector(&mut tensors))?;
        Ok(Self { tensors })
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut f = BufWriter::new(File::create(path)?);
        f.write_all(MAGIC)?;
        f.write_all(&VERSION.to_le_bytes())?;
        f.write_all(&(self.tensors.len() as u32).to_le_bytes())?;
        for (name, tensor) in &self.tensors {
            f.write_all(&(name.len() as u32).to_le_bytes())?;
            f.write_all(name.as_bytes())?;
            f.write_all(&(tensor.ndim() as u32).to_le_bytes())?;
            for &d in tensor.shape() {
                f.write_all(&(d as u32).to_le_bytes())?;
            }
            let data: Vec<f32> = tensor.iter().copied().collect();
            f.write_all(cast_slice(&data))?;
        }
        f.flush()?;
        Ok(())
    }

    /// Memory-map and parse a checkpoint file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Self::parse(&mmap[..])
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader { buf: bytes, offset: 0 };
        if reader.bytes(4)? != MAGIC {
            return Err(Error::Checkpoint("bad magic".to_string()));
        }
        let version = reader.u32()?;
        if version != VERSION {
            return Err(Error::Checkpoint(format!("unsupported version {}", version)));
        }

        let count = reader.u32()?;
        let mut tensors = BTreeMap::new();
        for _ in 0..count {
            let name_len = reader.u32()? as usize;
            let name = std::str::from_utf8(reader.bytes(name_len)?)
                .map_err(|e| Error::Checkpoint(format!("tensor name is not UTF-8: {}", e)))?
                .to_string();
            let rank = reader.u32()? as usize;
            let mut shape = Vec::with_capacity(rank);
            for _ in 0..rank {
                shape.push(reader.u32()? as usize);
            }
            let numel: usize = shape.iter().product();
            let data = reader
                .bytes(numel * 4)?
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            let tensor = ArrayD::from_shape_vec(IxDyn(&shape), data)
                .map_err(|e| Error::Checkpoint(format!("tensor `{}`: {}", name, e)))?;
            tensors.insert(name, tensor);
        }
        if reader.offset != bytes.len() {
            return Err(Error::Checkpoint(format!(
                "{} trailing bytes",
                bytes.len() - reader.offset
            )));
        }
        Ok(Self { tensors })
    }

    /// Copy tensors into every parameter of `model`. Each parameter must be
    /// present with a matching shape; unused tensors are reported.
    pub fn apply<M: Parameters + ?Sized>(&self, model: &mut M) -> Result<()> {
        let mut assigner = Assigner {
            checkpoint: self,
            used: BTreeSet::new(),
        };
        model.visit_params("", &mut assigner)?;
        for name in self.tensors.keys().filter(|n| !assigner.used.contains(*n)) {
            warn!("checkpoint tensor `{}` is not used by the model", name);
        }
        debug!("loaded {} tensors", assigner.used.len());
        Ok(())
    }
}

/// Load the checkpoint at `path` into `model`.
pub fn load_model<M: Parameters + ?Sized, P: AsRef<Path>>(model: &mut M, path: P) -> Result<()> {
    Checkpoint::load(path)?.apply(model)
}

struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Error::Checkpoint("unexpected end of file".to_string()))?;
        let out = &self.buf[self.offset..end];
        self.offset = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}
