//! # 块设备接口层
//!
//! 块设备是以**块**为单位存储数据的设备，例如磁盘、光盘、U盘等；
//! [`BlockDevice`] 就是对读写块设备的抽象，
//! 实现了此特质的类型称为**块设备驱动**。
//!
//! 读写都以整块为单位、同步完成，返回即视为已持久化。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod ram_disk;

use core::any::Any;

pub use self::ram_disk::RamDisk;

/// 块设备驱动特质
pub trait BlockDevice: Send + Sync + Any {
    /// 读出编号为 `block_id` 的整块，`buf` 的长度即块大小
    fn read_block(&self, block_id: usize, buf: &mut [u8]);
    /// 以 `buf` 覆盖编号为 `block_id` 的整块
    fn write_block(&self, block_id: usize, buf: &[u8]);
}
