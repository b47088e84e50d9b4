use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::BlockDevice;

/// 内存中的块设备，容量固定
#[derive(Debug)]
pub struct RamDisk {
    block_size: usize,
    blocks: usize,
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(block_size: usize, blocks: usize) -> Self {
        Self {
            block_size,
            blocks,
            data: Mutex::new(vec![0; block_size * blocks]),
        }
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    /// 块的字节范围，越界即为驱动使用错误
    fn range(&self, block_id: usize, len: usize) -> core::ops::Range<usize> {
        assert!(block_id < self.blocks, "block {block_id} out of device");
        assert_eq!(len, self.block_size, "not a complete block!");
        let start = block_id * self.block_size;
        start..start + self.block_size
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let range = self.range(block_id, buf.len());
        buf.copy_from_slice(&self.data.lock()[range]);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let range = self.range(block_id, buf.len());
        self.data.lock()[range].copy_from_slice(buf);
    }
}
