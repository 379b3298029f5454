//! Reader for `torch.save` checkpoints.
//!
//! Since PyTorch 1.6 `torch.save` writes a zip archive: `<name>/data.pkl`
//! holds the pickled object and every tensor storage sits raw, in little
//! endian order, at `<name>/data/<key>`. Tensors inside the pickle are
//! `torch._utils._rebuild_tensor_v2` calls whose first argument is a
//! persistent id naming the storage. Only the part of the pickle protocol
//! that a state dict needs is understood.

use crate::error::CheckpointError;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;
use tch::{Kind, Tensor};
use tracing::debug;
use zip::ZipArchive;

type Result<T> = std::result::Result<T, CheckpointError>;

const PICKLE: &str = "data.pkl";

/// Keys under which training scripts commonly nest the weights
const NESTED_KEYS: [&str; 2] = ["state_dict", "model_state_dict"];

/// Read every named tensor of a `torch.save`d state dict, in the order they
/// were saved
pub fn read_state_dict(path: &Path) -> Result<Vec<(String, Tensor)>> {
    let mut archive = ZipArchive::new(BufReader::new(File::open(path)?))?;
    let pickle_name = archive
        .file_names()
        .find(|name| name.rsplit('/').next() == Some(PICKLE))
        .map(String::from)
        .ok_or_else(|| CheckpointError::Layout(format!("no {PICKLE} in archive")))?;
    let prefix = pickle_name.trim_end_matches(PICKLE).to_string();

    let mut pickle = Vec::new();
    archive.by_name(&pickle_name)?.read_to_end(&mut pickle)?;
    debug!("unpickling {pickle_name} ({} bytes)", pickle.len());
    let root = Unpickler::new(&pickle).load()?;

    let mut storages = HashMap::new();
    state_dict_entries(root)?
        .into_iter()
        .map(|(name, view)| {
            let tensor = view.build(&mut archive, &prefix, &mut storages)?;
            Ok((name, tensor))
        })
        .collect()
}

/// The `(name, tensor)` pairs of the root dict, or of a dict nested under
/// one of `NESTED_KEYS`
fn state_dict_entries(root: Value) -> Result<Vec<(String, TensorView)>> {
    let mut entries = match root {
        Value::Dict(entries) => entries,
        other => {
            return Err(CheckpointError::Layout(format!(
                "root object is {}, not a dict",
                other.kind()
            )))
        }
    };

    let nested = entries.iter().position(|(key, value)| {
        matches!((key, value), (Value::Str(key), Value::Dict(_)) if NESTED_KEYS.contains(&key.as_str()))
    });
    if let Some(i) = nested {
        if let (_, Value::Dict(inner)) = entries.swap_remove(i) {
            entries = inner;
        }
    }

    entries
        .into_iter()
        .map(|(key, value)| match (key, value) {
            (Value::Str(name), Value::Tensor(view)) => Ok((name, view)),
            (Value::Str(name), other) => Err(CheckpointError::Layout(format!(
                "entry `{name}` is {}, not a tensor",
                other.kind()
            ))),
            (key, _) => Err(CheckpointError::Layout(format!(
                "dict key is {}, not a string",
                key.kind()
            ))),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
struct StorageRef {
    key: String,
    kind: Kind,
    numel: usize,
}

#[derive(Debug, Clone, PartialEq)]
struct TensorView {
    storage: StorageRef,
    offset: i64,
    size: Vec<i64>,
    stride: Vec<i64>,
}

impl TensorView {
    fn build<R: Read + Seek>(
        self,
        archive: &mut ZipArchive<R>,
        prefix: &str,
        storages: &mut HashMap<String, Tensor>,
    ) -> Result<Tensor> {
        if !storages.contains_key(&self.storage.key) {
            let storage = read_storage(archive, prefix, &self.storage)?;
            storages.insert(self.storage.key.clone(), storage);
        }
        let storage = &storages[&self.storage.key];
        Ok(storage
            .f_as_strided(self.size.as_slice(), self.stride.as_slice(), self.offset)?
            .f_contiguous()?)
    }
}

fn read_storage<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    prefix: &str,
    storage: &StorageRef,
) -> Result<Tensor> {
    let name = format!("{prefix}data/{}", storage.key);
    let mut data = Vec::new();
    archive.by_name(&name)?.read_to_end(&mut data)?;

    let expected = storage.numel * storage.kind.elt_size_in_bytes();
    if data.len() != expected {
        return Err(CheckpointError::Layout(format!(
            "{name} holds {} bytes, expected {expected}",
            data.len()
        )));
    }
    Ok(Tensor::f_from_data_size(
        &data,
        &[storage.numel as i64],
        storage.kind,
    )?)
}

fn storage_kind(name: &str) -> Option<Kind> {
    let kind = match name {
        "FloatStorage" => Kind::Float,
        "DoubleStorage" => Kind::Double,
        "HalfStorage" => Kind::Half,
        "BFloat16Storage" => Kind::BFloat16,
        "LongStorage" => Kind::Int64,
        "IntStorage" => Kind::Int,
        "ShortStorage" => Kind::Int16,
        "CharStorage" => Kind::Int8,
        "ByteStorage" => Kind::Uint8,
        "BoolStorage" => Kind::Bool,
        _ => return None,
    };
    Some(kind)
}

/// What the unpickler can hold on its stack
#[derive(Debug, Clone, PartialEq)]
enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Global { module: String, name: String },
    Storage(StorageRef),
    Tensor(TensorView),
    /// Anything built from a global this reader does not know
    Object(String),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "a bool",
            Value::Int(_) => "an int",
            Value::Float(_) => "a float",
            Value::Str(_) => "a string",
            Value::Bytes(_) => "bytes",
            Value::Tuple(_) => "a tuple",
            Value::List(_) => "a list",
            Value::Dict(_) => "a dict",
            Value::Global { .. } => "a global",
            Value::Storage(_) => "a storage",
            Value::Tensor(_) => "a tensor",
            Value::Object(_) => "an object",
        }
    }

    fn int(&self) -> Result<i64> {
        match self {
            Value::Int(i) => Ok(*i),
            other => Err(unsupported(format!("expected an int, found {}", other.kind()))),
        }
    }

    fn ints(&self) -> Result<Vec<i64>> {
        match self {
            Value::Tuple(items) | Value::List(items) => items.iter().map(Value::int).collect(),
            other => Err(unsupported(format!(
                "expected a tuple of ints, found {}",
                other.kind()
            ))),
        }
    }
}

fn unsupported(reason: impl Into<String>) -> CheckpointError {
    CheckpointError::Pickle(reason.into())
}

/// A pickle machine limited to the opcodes of protocols 2 to 4 that show up
/// in state dicts
struct Unpickler<'a> {
    data: &'a [u8],
    pos: usize,
    stack: Vec<Value>,
    marks: Vec<usize>,
    memo: HashMap<u32, Value>,
}

impl<'a> Unpickler<'a> {
    fn new(data: &'a [u8]) -> Self {
        Unpickler {
            data,
            pos: 0,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| unsupported("truncated pickle"))?;
        let data = self.data;
        let bytes = &data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn len(&mut self, width: usize) -> Result<usize> {
        let len = match width {
            1 => u64::from(self.u8()?),
            4 => u64::from(self.u32()?),
            _ => u64::from_le_bytes(self.array()?),
        };
        usize::try_from(len).map_err(|_| unsupported("length overflows usize"))
    }

    fn line(&mut self) -> Result<String> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| unsupported("unterminated GLOBAL"))?;
        let line = self.take(end + 1)?;
        Ok(String::from_utf8_lossy(&line[..end]).into_owned())
    }

    fn string(&mut self, width: usize) -> Result<Value> {
        let len = self.len(width)?;
        let bytes = self.take(len)?;
        let s = std::str::from_utf8(bytes).map_err(|e| unsupported(e.to_string()))?;
        Ok(Value::Str(s.to_string()))
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or_else(|| unsupported("stack underflow"))
    }

    fn top(&mut self) -> Result<&mut Value> {
        self.stack
            .last_mut()
            .ok_or_else(|| unsupported("stack underflow"))
    }

    /// Everything pushed since the last MARK
    fn pop_mark(&mut self) -> Result<Vec<Value>> {
        let mark = self
            .marks
            .pop()
            .ok_or_else(|| unsupported("no MARK on the stack"))?;
        if mark > self.stack.len() {
            return Err(unsupported("MARK above the stack top"));
        }
        Ok(self.stack.split_off(mark))
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>> {
        if n > self.stack.len() {
            return Err(unsupported("stack underflow"));
        }
        let at = self.stack.len() - n;
        Ok(self.stack.split_off(at))
    }

    fn put(&mut self, key: u32) -> Result<()> {
        let value = self
            .stack
            .last()
            .cloned()
            .ok_or_else(|| unsupported("stack underflow"))?;
        self.memo.insert(key, value);
        Ok(())
    }

    fn get(&mut self, key: u32) -> Result<()> {
        let value = self
            .memo
            .get(&key)
            .cloned()
            .ok_or_else(|| unsupported(format!("memo key {key} is unset")))?;
        self.stack.push(value);
        Ok(())
    }

    fn set_items(&mut self, items: Vec<Value>) -> Result<()> {
        if items.len() % 2 != 0 {
            return Err(unsupported("odd number of dict items"));
        }
        let Value::Dict(entries) = self.top()? else {
            return Err(unsupported("SETITEMS target is not a dict"));
        };
        let mut items = items.into_iter();
        while let (Some(key), Some(value)) = (items.next(), items.next()) {
            match entries.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = value,
                None => entries.push((key, value)),
            }
        }
        Ok(())
    }

    fn append(&mut self, items: Vec<Value>) -> Result<()> {
        match self.top()? {
            Value::List(list) => {
                list.extend(items);
                Ok(())
            }
            other => Err(unsupported(format!("cannot append to {}", other.kind()))),
        }
    }

    fn load(mut self) -> Result<Value> {
        loop {
            let op = self.u8()?;
            match op {
                // PROTO
                0x80 => {
                    self.u8()?;
                }
                // FRAME
                0x95 => {
                    self.take(8)?;
                }
                // STOP
                b'.' => return self.pop(),
                b'(' => self.marks.push(self.stack.len()),
                b'N' => self.stack.push(Value::None),
                0x88 => self.stack.push(Value::Bool(true)),
                0x89 => self.stack.push(Value::Bool(false)),
                // BININT1, BININT2, BININT
                b'K' => {
                    let i = self.u8()?;
                    self.stack.push(Value::Int(i64::from(i)));
                }
                b'M' => {
                    let i = u16::from_le_bytes(self.array()?);
                    self.stack.push(Value::Int(i64::from(i)));
                }
                b'J' => {
                    let i = i32::from_le_bytes(self.array()?);
                    self.stack.push(Value::Int(i64::from(i)));
                }
                // LONG1
                0x8a => {
                    let n = usize::from(self.u8()?);
                    if n > 8 {
                        return Err(unsupported("integer wider than 64 bits"));
                    }
                    let bytes = self.take(n)?;
                    let fill = if bytes.last().is_some_and(|b| b & 0x80 != 0) {
                        0xff
                    } else {
                        0
                    };
                    let mut buf = [fill; 8];
                    buf[..n].copy_from_slice(bytes);
                    self.stack.push(Value::Int(i64::from_le_bytes(buf)));
                }
                // BINFLOAT is big endian
                b'G' => {
                    let f = f64::from_be_bytes(self.array()?);
                    self.stack.push(Value::Float(f));
                }
                // SHORT_BINUNICODE, BINUNICODE, BINUNICODE8
                0x8c => {
                    let s = self.string(1)?;
                    self.stack.push(s);
                }
                b'X' => {
                    let s = self.string(4)?;
                    self.stack.push(s);
                }
                0x8d => {
                    let s = self.string(8)?;
                    self.stack.push(s);
                }
                // SHORT_BINBYTES, BINBYTES
                b'C' | b'B' => {
                    let len = self.len(if op == b'C' { 1 } else { 4 })?;
                    let bytes = self.take(len)?.to_vec();
                    self.stack.push(Value::Bytes(bytes));
                }
                b')' => self.stack.push(Value::Tuple(Vec::new())),
                b']' => self.stack.push(Value::List(Vec::new())),
                b'}' => self.stack.push(Value::Dict(Vec::new())),
                // TUPLE1, TUPLE2, TUPLE3
                0x85..=0x87 => {
                    let items = self.pop_n(usize::from(op - 0x84))?;
                    self.stack.push(Value::Tuple(items));
                }
                b't' => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::Tuple(items));
                }
                b'l' => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::List(items));
                }
                b'd' => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::Dict(Vec::new()));
                    self.set_items(items)?;
                }
                // BINPUT, LONG_BINPUT, MEMOIZE
                b'q' => {
                    let key = self.u8()?;
                    self.put(u32::from(key))?;
                }
                b'r' => {
                    let key = self.u32()?;
                    self.put(key)?;
                }
                0x94 => {
                    let key = self.memo.len() as u32;
                    self.put(key)?;
                }
                // BINGET, LONG_BINGET
                b'h' => {
                    let key = self.u8()?;
                    self.get(u32::from(key))?;
                }
                b'j' => {
                    let key = self.u32()?;
                    self.get(key)?;
                }
                // GLOBAL, STACK_GLOBAL
                b'c' => {
                    let module = self.line()?;
                    let name = self.line()?;
                    self.stack.push(Value::Global { module, name });
                }
                0x93 => {
                    let (name, module) = (self.pop()?, self.pop()?);
                    match (module, name) {
                        (Value::Str(module), Value::Str(name)) => {
                            self.stack.push(Value::Global { module, name })
                        }
                        _ => return Err(unsupported("STACK_GLOBAL without strings")),
                    }
                }
                // BINPERSID
                b'Q' => {
                    let pid = self.pop()?;
                    self.stack.push(persistent_load(pid)?);
                }
                // REDUCE, NEWOBJ
                b'R' | 0x81 => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    self.stack.push(reduce(callable, args)?);
                }
                // BUILD: object state such as `_metadata` is not needed
                b'b' => {
                    self.pop()?;
                }
                b's' => {
                    let items = self.pop_n(2)?;
                    self.set_items(items)?;
                }
                b'u' => {
                    let items = self.pop_mark()?;
                    self.set_items(items)?;
                }
                b'a' => {
                    let item = self.pop()?;
                    self.append(vec![item])?;
                }
                b'e' => {
                    let items = self.pop_mark()?;
                    self.append(items)?;
                }
                _ => {
                    return Err(unsupported(format!(
                        "opcode 0x{op:02x} at offset {}",
                        self.pos - 1
                    )))
                }
            }
        }
    }
}

/// `('storage', torch.<Type>Storage, key, location, numel)`
fn persistent_load(pid: Value) -> Result<Value> {
    let Value::Tuple(fields) = pid else {
        return Err(unsupported("persistent id is not a tuple"));
    };
    match fields.as_slice() {
        [Value::Str(tag), Value::Global { name, .. }, Value::Str(key), _location, Value::Int(numel)]
            if tag == "storage" =>
        {
            let kind = storage_kind(name)
                .ok_or_else(|| unsupported(format!("storage type {name}")))?;
            let numel = usize::try_from(*numel)
                .map_err(|_| unsupported(format!("storage {key} has {numel} elements")))?;
            Ok(Value::Storage(StorageRef {
                key: key.clone(),
                kind,
                numel,
            }))
        }
        _ => Err(unsupported("persistent id is not a storage")),
    }
}

fn reduce(callable: Value, args: Value) -> Result<Value> {
    let (module, name) = match callable {
        Value::Global { module, name } => (module, name),
        other => return Err(unsupported(format!("cannot call {}", other.kind()))),
    };
    let Value::Tuple(args) = args else {
        return Err(unsupported(format!("{module}.{name} called without a tuple")));
    };

    match (module.as_str(), name.as_str()) {
        ("collections", "OrderedDict") => {
            let mut entries = Vec::new();
            if let Some(Value::List(pairs)) = args.into_iter().next() {
                for pair in pairs {
                    match pair {
                        Value::Tuple(kv) if kv.len() == 2 => {
                            let mut kv = kv.into_iter();
                            if let (Some(k), Some(v)) = (kv.next(), kv.next()) {
                                entries.push((k, v));
                            }
                        }
                        _ => return Err(unsupported("OrderedDict item is not a pair")),
                    }
                }
            }
            Ok(Value::Dict(entries))
        }
        ("torch._utils", "_rebuild_tensor") | ("torch._utils", "_rebuild_tensor_v2") => {
            match args.as_slice() {
                [Value::Storage(storage), offset, size, stride, ..] => {
                    Ok(Value::Tensor(TensorView {
                        storage: storage.clone(),
                        offset: offset.int()?,
                        size: size.ints()?,
                        stride: stride.ints()?,
                    }))
                }
                _ => Err(unsupported(format!("{name} arguments"))),
            }
        }
        // nn.Parameter wraps the tensor as its first argument
        ("torch._utils", "_rebuild_parameter") => match args.into_iter().next() {
            Some(tensor @ Value::Tensor(_)) => Ok(tensor),
            _ => Err(unsupported("_rebuild_parameter without a tensor")),
        },
        _ => Ok(Value::Object(format!("{module}.{name}"))),
    }
}
