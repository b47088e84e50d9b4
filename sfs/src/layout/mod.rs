//! # 磁盘数据结构层
//!
//! sfs 的磁盘布局：
//! 超级块 | inode 区域 | 数据块区域
//!
//! - 0 号块：超级块
//! - `1 .. 1 + ceil(inode 数 / 16)`：inode 区域，每块 16 个 32 字节的 inode
//! - 其余：数据块区域，未被任何 inode 引用的块串成空闲链表
//!
//! 所有多字节整数均按**大端序**存放。

mod directory;
mod inode;
mod super_block;

pub use self::{
    directory::Directory,
    inode::{AllocError, IndirectError, Inode},
    super_block::SuperBlock,
};

use crate::BLOCK_SIZE;

/// 未分配的块地址
pub const NIL: i16 = -1;
/// 空闲链表的尽头
pub const NIL_BLOCK: i32 = -1;

/// inode 的直接索引个数
pub const DIRECT_COUNT: usize = 11;
/// 间接索引块可容纳的块编号个数
pub const INDIRECT_COUNT: usize = BLOCK_SIZE / 2;
/// 盘上 inode 恒为32字节
pub const INODE_SIZE: usize = 32;
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
/// 单个文件的容量上限(字节)
pub const MAX_FILE_SIZE: usize = (DIRECT_COUNT + INDIRECT_COUNT) * BLOCK_SIZE;
/// 文件名最多容纳的 UTF-16 码元数
pub const NAME_MAX_LEN: usize = 30;

/// inode 区域占据的块数
#[inline]
pub fn inode_blocks(inodes: usize) -> usize {
    inodes.div_ceil(INODES_PER_BLOCK)
}

/// 数据块区域的起始块
#[inline]
pub fn data_start(inodes: usize) -> usize {
    1 + inode_blocks(inodes)
}

/// 通过 inode 编号获取其在磁盘上的位置：**块ID**以及**块内偏移**
#[inline]
pub fn inode_pos(inumber: u16) -> (usize, usize) {
    let inumber = inumber as usize;
    (
        1 + inumber / INODES_PER_BLOCK,
        inumber % INODES_PER_BLOCK * INODE_SIZE,
    )
}

#[inline]
pub fn read_i32(buf: &[u8], offset: usize) -> i32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    i32::from_be_bytes(bytes)
}

#[inline]
pub fn write_i32(value: i32, buf: &mut [u8], offset: usize) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn read_i16(buf: &[u8], offset: usize) -> i16 {
    let mut bytes = [0; 2];
    bytes.copy_from_slice(&buf[offset..offset + 2]);
    i16::from_be_bytes(bytes)
}

#[inline]
pub fn write_i16(value: i16, buf: &mut [u8], offset: usize) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}
