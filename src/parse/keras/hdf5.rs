//! Minimal read-only HDF5 parser.
//!
//! Covers exactly the subset Keras model files use: version 0/1
//! superblocks, version 1 object headers (with continuation blocks),
//! symbol-table groups (B-tree v1 + local heap), contiguous and compact
//! dataset layouts, scalar and simple dataspaces, IEEE f32 little-endian
//! datasets, and fixed or variable-length string attributes. Variable-length
//! attribute elements are 16-byte (length, global heap collection, index)
//! records resolved through the global heap.
//!
//! Anything outside this subset fails with a descriptive error instead of
//! being misparsed.

use std::path::Path;

use crate::error::{Error, Result};

const UNDEFINED_ADDR: u64 = u64::MAX;

const MSG_DATASPACE: u16 = 0x01;
const MSG_DATATYPE: u16 = 0x03;
const MSG_LAYOUT: u16 = 0x08;
const MSG_ATTRIBUTE: u16 = 0x0c;
const MSG_CONTINUATION: u16 = 0x10;
const MSG_SYMBOL_TABLE: u16 = 0x11;

fn err(msg: impl Into<String>) -> Error {
    Error::ModelLoad(msg.into())
}

/// Bounds-checked little-endian cursor.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn at(data: &'a [u8], pos: usize) -> Result<Self> {
        if pos > data.len() {
            return Err(err("offset beyond end of file"));
        }
        Ok(Reader { data, pos })
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(err("truncated file"));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }
}

#[derive(Debug, Clone)]
enum Datatype {
    F32Le,
    FixedString { size: usize },
    VlenString,
    Other,
}

fn parse_datatype(body: &[u8]) -> Result<Datatype> {
    let mut r = Reader::at(body, 0)?;
    let class_and_version = r.u8()?;
    let class = class_and_version & 0x0f;
    let bits0 = r.u8()?;
    let _bits1 = r.u8()?;
    let _bits2 = r.u8()?;
    let size = r.u32()? as usize;
    Ok(match class {
        1 => {
            // Floating point; bit 0 of the class bit field is the byte order.
            if size == 4 && bits0 & 0x01 == 0 {
                Datatype::F32Le
            } else {
                Datatype::Other
            }
        }
        3 => Datatype::FixedString { size },
        9 => {
            // Variable length; low nibble 1 means string.
            if bits0 & 0x0f == 1 {
                Datatype::VlenString
            } else {
                Datatype::Other
            }
        }
        _ => Datatype::Other,
    })
}

fn parse_dataspace(body: &[u8]) -> Result<Vec<usize>> {
    let mut r = Reader::at(body, 0)?;
    let version = r.u8()?;
    let rank = r.u8()? as usize;
    let flags = r.u8()?;
    match version {
        1 => r.skip(5)?,
        2 => {
            let space_type = r.u8()?;
            if space_type == 2 {
                return Err(err("null dataspaces are not supported"));
            }
        }
        v => return Err(err(format!("unsupported dataspace version {v}"))),
    }
    let mut dims = Vec::with_capacity(rank);
    for _ in 0..rank {
        dims.push(r.u64()? as usize);
    }
    if flags & 0x01 != 0 {
        for _ in 0..rank {
            r.u64()?;
        }
    }
    Ok(dims)
}

#[derive(Debug)]
enum Layout {
    Compact { offset: usize, size: usize },
    Contiguous { address: u64, size: u64 },
}

struct Message {
    kind: u16,
    /// Offset and length of the body within the file.
    offset: usize,
    length: usize,
}

struct Attribute {
    datatype: Datatype,
    dims: Vec<usize>,
    /// Offset of the attribute data within the file.
    data_offset: usize,
    data_len: usize,
}

pub struct Hdf5File {
    data: Vec<u8>,
    root_header: u64,
}

impl Hdf5File {
    pub fn open(path: &Path) -> Result<Hdf5File> {
        let data = std::fs::read(path)
            .map_err(|e| err(format!("{}: {e}", path.display())))?;
        let mut r = Reader::at(&data, 0)?;
        if r.bytes(8)? != b"\x89HDF\r\n\x1a\n" {
            return Err(err("not an HDF5 file"));
        }
        let version = r.u8()?;
        if version > 1 {
            return Err(err(format!(
                "superblock version {version} is not supported"
            )));
        }
        r.skip(1)?; // free space version
        r.skip(1)?; // root symbol table version
        r.skip(1)?; // reserved
        r.skip(1)?; // shared header version
        let offset_size = r.u8()?;
        let length_size = r.u8()?;
        if offset_size != 8 || length_size != 8 {
            return Err(err("only 8-byte offsets and lengths are supported"));
        }
        r.skip(1)?; // reserved
        r.u16()?; // group leaf k
        r.u16()?; // group internal k
        r.u32()?; // consistency flags
        if version == 1 {
            r.u16()?; // indexed storage k
            r.u16()?; // reserved
        }
        let _base = r.u64()?;
        let _free_space = r.u64()?;
        let _eof = r.u64()?;
        let _driver_info = r.u64()?;
        // Root group symbol table entry.
        let _link_name_offset = r.u64()?;
        let root_header = r.u64()?;

        Ok(Hdf5File { data, root_header })
    }

    pub fn root(&self) -> Group<'_> {
        Group {
            file: self,
            header: self.root_header,
        }
    }

    /// All messages of the object header at `addr`, continuations resolved.
    fn messages(&self, addr: u64) -> Result<Vec<Message>> {
        let mut r = Reader::at(&self.data, addr as usize)?;
        let version = r.u8()?;
        if version != 1 {
            return Err(err(format!("object header version {version} is not supported")));
        }
        r.skip(1)?;
        let count = r.u16()? as usize;
        r.u32()?; // reference count
        let header_size = r.u32()? as usize;
        r.skip(4)?; // padding to an 8-byte boundary

        let mut messages = Vec::with_capacity(count);
        // (start, remaining) block stack; continuations push new blocks.
        let mut blocks = vec![(r.pos, header_size)];
        while messages.len() < count {
            let Some((pos, remaining)) = blocks.pop() else {
                return Err(err("object header message count overruns its blocks"));
            };
            let mut r = Reader::at(&self.data, pos)?;
            let mut left = remaining;
            while left >= 8 && messages.len() < count {
                let kind = r.u16()?;
                let size = r.u16()? as usize;
                r.u8()?; // flags
                r.skip(3)?;
                let offset = r.pos;
                r.skip(size)?;
                left = left.saturating_sub(8 + size);
                if kind == MSG_CONTINUATION {
                    let mut c = Reader::at(&self.data, offset)?;
                    let cont_addr = c.u64()? as usize;
                    let cont_len = c.u64()? as usize;
                    blocks.push((r.pos, left));
                    blocks.push((cont_addr, cont_len));
                    messages.push(Message {
                        kind,
                        offset,
                        length: size,
                    });
                    break;
                }
                messages.push(Message {
                    kind,
                    offset,
                    length: size,
                });
            }
        }
        Ok(messages)
    }

    fn body(&self, message: &Message) -> &[u8] {
        &self.data[message.offset..message.offset + message.length]
    }

    /// Resolves one element of a variable-length string through the global
    /// heap: a 16-byte (length, collection address, index) record.
    fn vlen_string(&self, record: &[u8]) -> Result<String> {
        let mut r = Reader::at(record, 0)?;
        let length = r.u32()? as usize;
        let collection = r.u64()?;
        let index = r.u32()?;

        let mut g = Reader::at(&self.data, collection as usize)?;
        if g.bytes(4)? != b"GCOL" {
            return Err(err("bad global heap signature"));
        }
        let version = g.u8()?;
        if version != 1 {
            return Err(err("unsupported global heap version"));
        }
        g.skip(3)?;
        let collection_size = g.u64()? as usize;
        let end = collection as usize + collection_size;
        while g.pos + 16 <= end {
            let object_index = g.u16()?;
            g.u16()?; // reference count
            g.u32()?;
            let object_size = g.u64()? as usize;
            if object_index == 0 {
                break;
            }
            if object_index as u32 == index {
                let bytes = g.bytes(length.min(object_size))?;
                return String::from_utf8(bytes.to_vec())
                    .map_err(|_| err("attribute string is not valid UTF-8"));
            }
            g.skip(object_size.div_ceil(8) * 8)?;
        }
        Err(err("global heap object not found"))
    }

    fn parse_attribute(&self, message: &Message) -> Result<(String, Attribute)> {
        let body = self.body(message);
        let mut r = Reader::at(body, 0)?;
        let version = r.u8()?;
        let pad8 = version == 1;
        match version {
            1 => {
                r.skip(1)?;
            }
            2 => {
                let flags = r.u8()?;
                if flags & 0x03 != 0 {
                    return Err(err("shared attribute datatypes are not supported"));
                }
            }
            3 => {
                let flags = r.u8()?;
                if flags & 0x03 != 0 {
                    return Err(err("shared attribute datatypes are not supported"));
                }
            }
            v => return Err(err(format!("unsupported attribute version {v}"))),
        }
        let name_size = r.u16()? as usize;
        let datatype_size = r.u16()? as usize;
        let dataspace_size = r.u16()? as usize;
        if version == 3 {
            r.u8()?; // name character set
        }
        let padded = |n: usize| if pad8 { n.div_ceil(8) * 8 } else { n };

        let name_bytes = r.bytes(padded(name_size))?;
        let name = name_bytes[..name_size]
            .split(|&b| b == 0)
            .next()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .unwrap_or_default();
        let datatype = parse_datatype(&r.bytes(padded(datatype_size))?[..datatype_size])?;
        let dims = parse_dataspace(&r.bytes(padded(dataspace_size))?[..dataspace_size])?;
        let data_offset = message.offset + r.pos;
        let data_len = message.length - r.pos;
        Ok((
            name,
            Attribute {
                datatype,
                dims,
                data_offset,
                data_len,
            },
        ))
    }
}

pub struct Group<'f> {
    file: &'f Hdf5File,
    header: u64,
}

impl<'f> Group<'f> {
    fn find_attribute(&self, name: &str) -> Result<Attribute> {
        for message in self.file.messages(self.header)? {
            if message.kind != MSG_ATTRIBUTE {
                continue;
            }
            let (attr_name, attr) = self.file.parse_attribute(&message)?;
            if attr_name == name {
                return Ok(attr);
            }
        }
        Err(err(format!("attribute \"{name}\" not found")))
    }

    /// A scalar string attribute (fixed or variable length).
    pub fn attr_str(&self, name: &str) -> Result<String> {
        let attr = self.find_attribute(name)?;
        if !attr.dims.is_empty() {
            return Err(err(format!("attribute \"{name}\" is not scalar")));
        }
        let data = &self.file.data[attr.data_offset..attr.data_offset + attr.data_len];
        match attr.datatype {
            Datatype::VlenString => self.file.vlen_string(data),
            Datatype::FixedString { size } => Ok(String::from_utf8_lossy(
                data[..size.min(data.len())].split(|&b| b == 0).next().unwrap_or(&[]),
            )
            .into_owned()),
            _ => Err(err(format!("attribute \"{name}\" is not a string"))),
        }
    }

    /// A rank-1 string attribute.
    pub fn attr_str_array(&self, name: &str) -> Result<Vec<String>> {
        let attr = self.find_attribute(name)?;
        if attr.dims.len() != 1 {
            return Err(err(format!("attribute \"{name}\" is not a string array")));
        }
        let count = attr.dims[0];
        let data = &self.file.data[attr.data_offset..attr.data_offset + attr.data_len];
        match attr.datatype {
            Datatype::VlenString => {
                // One 16-byte heap reference per element.
                if data.len() < count * 16 {
                    return Err(err("variable-length attribute storage is truncated"));
                }
                (0..count)
                    .map(|i| self.file.vlen_string(&data[i * 16..(i + 1) * 16]))
                    .collect()
            }
            Datatype::FixedString { size } => {
                if data.len() < count * size {
                    return Err(err("fixed string attribute storage is truncated"));
                }
                Ok((0..count)
                    .map(|i| {
                        let s = &data[i * size..(i + 1) * size];
                        String::from_utf8_lossy(s.split(|&b| b == 0).next().unwrap_or(&[]))
                            .into_owned()
                    })
                    .collect())
            }
            _ => Err(err(format!("attribute \"{name}\" is not a string array"))),
        }
    }

    /// Address of the object header of a named child, via the group's
    /// B-tree and local heap.
    fn child(&self, name: &str) -> Result<u64> {
        let mut btree = UNDEFINED_ADDR;
        let mut heap = UNDEFINED_ADDR;
        for message in self.file.messages(self.header)? {
            if message.kind == MSG_SYMBOL_TABLE {
                let mut r = Reader::at(self.file.body(&message), 0)?;
                btree = r.u64()?;
                heap = r.u64()?;
            }
        }
        if btree == UNDEFINED_ADDR || heap == UNDEFINED_ADDR {
            return Err(err(format!("\"{name}\": parent is not a symbol-table group")));
        }

        // Local heap data segment for link names.
        let mut h = Reader::at(&self.file.data, heap as usize)?;
        if h.bytes(4)? != b"HEAP" {
            return Err(err("bad local heap signature"));
        }
        h.skip(4)?;
        h.u64()?; // data segment size
        h.u64()?; // free list head
        let heap_data = h.u64()? as usize;

        self.search_btree(btree, heap_data, name)?
            .ok_or_else(|| err(format!("\"{name}\" not found")))
    }

    fn search_btree(&self, addr: u64, heap_data: usize, name: &str) -> Result<Option<u64>> {
        let mut r = Reader::at(&self.file.data, addr as usize)?;
        if r.bytes(4)? != b"TREE" {
            return Err(err("bad B-tree signature"));
        }
        let node_type = r.u8()?;
        if node_type != 0 {
            return Err(err("unexpected B-tree node type"));
        }
        let level = r.u8()?;
        let entries = r.u16()? as usize;
        r.u64()?; // left sibling
        r.u64()?; // right sibling
        r.u64()?; // first key
        for _ in 0..entries {
            let child = r.u64()?;
            r.u64()?; // next key
            if level > 0 {
                if let Some(found) = self.search_btree(child, heap_data, name)? {
                    return Ok(Some(found));
                }
            } else if let Some(found) = self.search_snod(child, heap_data, name)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    fn search_snod(&self, addr: u64, heap_data: usize, name: &str) -> Result<Option<u64>> {
        let mut r = Reader::at(&self.file.data, addr as usize)?;
        if r.bytes(4)? != b"SNOD" {
            return Err(err("bad symbol table node signature"));
        }
        r.skip(2)?;
        let symbols = r.u16()? as usize;
        for _ in 0..symbols {
            let link_name_offset = r.u64()? as usize;
            let header = r.u64()?;
            r.u32()?; // cache type
            r.u32()?;
            r.skip(16)?; // scratch
            let name_start = heap_data + link_name_offset;
            let entry_name = self.file.data[name_start..]
                .split(|&b| b == 0)
                .next()
                .unwrap_or(&[]);
            if entry_name == name.as_bytes() {
                return Ok(Some(header));
            }
        }
        Ok(None)
    }

    pub fn group(&self, name: &str) -> Result<Group<'f>> {
        Ok(Group {
            file: self.file,
            header: self.child(name)?,
        })
    }

    /// Reads a named f32 dataset as `(values, shape)`.
    pub fn dataset_f32(&self, name: &str) -> Result<(Vec<f32>, Vec<usize>)> {
        let header = self.child(name)?;
        let mut datatype = None;
        let mut dims = None;
        let mut layout = None;
        for message in self.file.messages(header)? {
            let body = self.file.body(&message);
            match message.kind {
                MSG_DATATYPE => datatype = Some(parse_datatype(body)?),
                MSG_DATASPACE => dims = Some(parse_dataspace(body)?),
                MSG_LAYOUT => {
                    let mut r = Reader::at(body, 0)?;
                    let version = r.u8()?;
                    if version != 3 {
                        return Err(err(format!(
                            "dataset layout version {version} is not supported"
                        )));
                    }
                    let class = r.u8()?;
                    layout = Some(match class {
                        0 => {
                            let size = r.u16()? as usize;
                            Layout::Compact {
                                offset: message.offset + r.pos,
                                size,
                            }
                        }
                        1 => {
                            let address = r.u64()?;
                            let size = r.u64()?;
                            Layout::Contiguous { address, size }
                        }
                        _ => {
                            return Err(Error::UnsupportedOption(
                                "chunked dataset storage".into(),
                            ))
                        }
                    });
                }
                _ => {}
            }
        }

        match datatype {
            Some(Datatype::F32Le) => {}
            _ => {
                return Err(Error::UnsupportedOption(format!(
                    "dataset \"{name}\" is not little-endian float32"
                )))
            }
        }
        let dims = dims.ok_or_else(|| err("dataset without a dataspace"))?;
        let count: usize = dims.iter().product();
        let (offset, size) = match layout.ok_or_else(|| err("dataset without a layout"))? {
            Layout::Compact { offset, size } => (offset, size),
            Layout::Contiguous { address, size } => {
                if address == UNDEFINED_ADDR {
                    return Err(err("dataset has no allocated storage"));
                }
                (address as usize, size as usize)
            }
        };
        if size < count * 4 || offset + count * 4 > self.file.data.len() {
            return Err(err("dataset storage is truncated"));
        }
        let mut values = Vec::with_capacity(count);
        for i in 0..count {
            let at = offset + i * 4;
            values.push(f32::from_le_bytes(
                self.file.data[at..at + 4].try_into().unwrap(),
            ));
        }
        Ok((values, dims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_hdf5_data() {
        let dir = std::env::temp_dir().join("compiled-nn-hdf5-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("not-a-model.h5");
        std::fs::write(&path, b"definitely not hdf5").unwrap();
        assert!(matches!(
            Hdf5File::open(&path),
            Err(Error::ModelLoad(_))
        ));
    }

    #[test]
    fn datatype_classes() {
        // class 1 (float), little endian, 4 bytes
        let f32le = [0x11u8, 0x20, 0x1f, 0x00, 4, 0, 0, 0];
        assert!(matches!(parse_datatype(&f32le), Ok(Datatype::F32Le)));
        // class 3 (string), 12 bytes
        let fixed = [0x13u8, 0x00, 0x00, 0x00, 12, 0, 0, 0];
        assert!(matches!(
            parse_datatype(&fixed),
            Ok(Datatype::FixedString { size: 12 })
        ));
        // class 9 (vlen), string variant
        let vlen = [0x19u8, 0x01, 0x00, 0x00, 16, 0, 0, 0];
        assert!(matches!(parse_datatype(&vlen), Ok(Datatype::VlenString)));
    }

    #[test]
    fn dataspace_versions() {
        // v1, rank 2, no max dims, 5 reserved bytes
        let mut v1 = vec![1u8, 2, 0, 0, 0, 0, 0, 0];
        v1.extend_from_slice(&3u64.to_le_bytes());
        v1.extend_from_slice(&4u64.to_le_bytes());
        assert_eq!(parse_dataspace(&v1).unwrap(), vec![3, 4]);
        // v2 scalar
        let v2 = [2u8, 0, 0, 0];
        assert_eq!(parse_dataspace(&v2).unwrap(), Vec::<usize>::new());
    }
}
