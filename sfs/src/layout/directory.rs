use super::{read_i32, write_i32, NAME_MAX_LEN};

/// 根目录：文件名到 inode 编号的映射表
///
/// 每个 inode 编号对应一个槽位，槽位记录文件名长度与定长的文件名；
/// 长度为 0 表示空槽。0 号槽位恒为 `"/"`，即目录自身。
///
/// 目录作为 0 号 inode 的内容保存，字节布局为：
/// 先是全部槽位的长度(各 4 字节)，再是全部槽位的文件名(各 [`NAME_MAX_LEN`] 个 UTF-16 码元)。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    /// 文件名长度，以 UTF-16 码元计
    sizes: Vec<i32>,
    names: Vec<[u16; NAME_MAX_LEN]>,
}

impl Directory {
    pub const ROOT: &'static str = "/";

    /// 单个槽位的字节数
    const SLOT_SIZE: usize = 4 + NAME_MAX_LEN * 2;

    pub fn new(slots: usize) -> Self {
        let mut dir = Self {
            sizes: vec![0; slots],
            names: vec![[0; NAME_MAX_LEN]; slots],
        };
        if slots > 0 {
            dir.fill(0, &Self::encode(Self::ROOT));
        }
        dir
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.sizes.len()
    }

    /// 序列化后的字节数
    #[inline]
    pub fn serialized_len(slots: usize) -> usize {
        slots * Self::SLOT_SIZE
    }

    /// 从字节恢复目录，长度必须与槽位数吻合
    pub fn load(&mut self, data: &[u8]) -> bool {
        let slots = self.capacity();
        if data.len() != Self::serialized_len(slots) {
            return false;
        }

        for slot in 0..slots {
            self.sizes[slot] = read_i32(data, slot * 4).clamp(0, NAME_MAX_LEN as i32);
        }
        let names = &data[slots * 4..];
        for (slot, name) in self.names.iter_mut().enumerate() {
            let raw = &names[slot * NAME_MAX_LEN * 2..(slot + 1) * NAME_MAX_LEN * 2];
            for (unit, bytes) in name.iter_mut().zip(raw.chunks_exact(2)) {
                *unit = u16::from_be_bytes([bytes[0], bytes[1]]);
            }
        }

        true
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let slots = self.capacity();
        let mut data = vec![0; Self::serialized_len(slots)];

        for (slot, &size) in self.sizes.iter().enumerate() {
            write_i32(size, &mut data, slot * 4);
        }
        let names = &mut data[slots * 4..];
        for (slot, name) in self.names.iter().enumerate() {
            let size = self.sizes[slot] as usize;
            for (index, unit) in name[..size].iter().enumerate() {
                let offset = (slot * NAME_MAX_LEN + index) * 2;
                names[offset..offset + 2].copy_from_slice(&unit.to_be_bytes());
            }
        }

        data
    }

    /// 为新文件占用第一个空槽位，返回其 inode 编号；
    /// 过长的文件名被截断
    pub fn ialloc(&mut self, name: &str) -> Option<u16> {
        let units = Self::encode(name);
        if units.is_empty() {
            return None;
        }

        let slot = self.sizes.iter().position(|&size| size == 0)?;
        self.fill(slot, &units);
        Some(slot as u16)
    }

    /// 释放槽位；0 号槽位与空槽位不可释放
    pub fn ifree(&mut self, inumber: u16) -> bool {
        let slot = inumber as usize;
        if slot == 0 || slot >= self.capacity() || self.sizes[slot] == 0 {
            return false;
        }

        self.sizes[slot] = 0;
        self.names[slot].fill(0);
        true
    }

    pub fn namei(&self, name: &str) -> Option<u16> {
        let units = Self::encode(name);
        if units.is_empty() {
            return None;
        }

        self.sizes
            .iter()
            .zip(&self.names)
            .position(|(&size, slot)| size as usize == units.len() && slot[..units.len()] == units)
            .map(|slot| slot as u16)
    }

    /// 全部已占用的槽位，不含根目录自身
    pub fn entries(&self) -> impl Iterator<Item = (u16, String)> + '_ {
        self.sizes
            .iter()
            .zip(&self.names)
            .enumerate()
            .skip(1)
            .filter(|(_, (size, _))| **size > 0)
            .map(|(slot, (&size, name))| {
                (slot as u16, String::from_utf16_lossy(&name[..size as usize]))
            })
    }

    fn fill(&mut self, slot: usize, units: &[u16]) {
        self.names[slot].fill(0);
        self.names[slot][..units.len()].copy_from_slice(units);
        self.sizes[slot] = units.len() as i32;
    }

    /// 文件名转为至多 [`NAME_MAX_LEN`] 个码元，不拆开代理对
    fn encode(name: &str) -> Vec<u16> {
        let mut units = Vec::with_capacity(NAME_MAX_LEN);
        for ch in name.chars() {
            let mut buf = [0; 2];
            let encoded = ch.encode_utf16(&mut buf);
            if units.len() + encoded.len() > NAME_MAX_LEN {
                break;
            }
            units.extend_from_slice(encoded);
        }
        units
    }
}
