//! inode 的块索引
//!
//! - 直接索引：11 个槽位，每个直接指向一个**数据块**，按下标顺序依次填充
//! - 间接索引：一个块，整个块连续存储 [`INDIRECT_COUNT`] 个块编号，
//!   只有直接索引全部占满后才能分配
//!
//! 块编号均为 16 位，未分配的槽位为 [`NIL`]。
//!
//! ## 盘上布局
//!
//! `length`(4) `open_count`(2) `state`(2) `direct`(11 × 2) `indirect`(2)

use core::ops::Range;

use super::{
    inode_pos, read_i16, read_i32, write_i16, write_i32, DIRECT_COUNT, INDIRECT_COUNT,
    INODE_SIZE, NIL,
};
use crate::block_cache::BlockCacheManager;
use crate::file_table::AccessState;
use crate::BLOCK_SIZE;

const LENGTH_OFFSET: usize = 0;
const COUNT_OFFSET: usize = 4;
const STATE_OFFSET: usize = 6;
const DIRECT_OFFSET: usize = 8;
const INDIRECT_OFFSET: usize = DIRECT_OFFSET + DIRECT_COUNT * 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    /// 文件大小(字节)
    pub length: i32,
    /// 指向该 inode 的句柄数
    pub open_count: i16,
    pub state: AccessState,
    direct: [i16; DIRECT_COUNT],
    /// 间接索引块
    indirect: i16,
}

/// 分配数据块失败的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// 目标槽位已有块
    AlreadyAllocated,
    /// 前一个直接索引槽位还空着
    OutOfOrder,
    /// 需要先分配间接索引块
    IndirectMissing,
    /// 超出 inode 的寻址范围
    OutOfRange,
}

/// 分配间接索引块失败的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndirectError {
    /// 直接索引尚未占满
    NotReady,
    AlreadyAllocated,
}

impl Default for Inode {
    fn default() -> Self {
        Self {
            length: 0,
            open_count: 0,
            state: AccessState::Closed,
            direct: [NIL; DIRECT_COUNT],
            indirect: NIL,
        }
    }
}

impl Inode {
    pub fn load(inumber: u16, cache: &BlockCacheManager) -> Self {
        let (block_id, offset) = inode_pos(inumber);
        cache.read(block_id, |block| {
            Self::from_bytes(&block[offset..offset + INODE_SIZE])
        })
    }

    pub fn store(&self, inumber: u16, cache: &BlockCacheManager) {
        let (block_id, offset) = inode_pos(inumber);
        cache.modify(block_id, |block| {
            self.write_to(&mut block[offset..offset + INODE_SIZE])
        });
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let open_count = read_i16(buf, COUNT_OFFSET);
        let mut direct = [NIL; DIRECT_COUNT];
        for (index, slot) in direct.iter_mut().enumerate() {
            *slot = read_i16(buf, DIRECT_OFFSET + index * 2);
        }

        Self {
            length: read_i32(buf, LENGTH_OFFSET),
            open_count,
            state: AccessState::from_tag(read_i16(buf, STATE_OFFSET), open_count),
            direct,
            indirect: read_i16(buf, INDIRECT_OFFSET),
        }
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        write_i32(self.length, buf, LENGTH_OFFSET);
        write_i16(self.open_count, buf, COUNT_OFFSET);
        write_i16(self.state.tag(), buf, STATE_OFFSET);
        for (index, &slot) in self.direct.iter().enumerate() {
            write_i16(slot, buf, DIRECT_OFFSET + index * 2);
        }
        write_i16(self.indirect, buf, INDIRECT_OFFSET);
    }

    #[inline]
    pub fn has_indirect(&self) -> bool {
        self.indirect != NIL
    }

    /// 字节偏移所在的数据块，未分配时为空
    pub fn resolve_block(&self, offset: usize, cache: &BlockCacheManager) -> Option<usize> {
        let index = offset / BLOCK_SIZE;

        let block_id = if index < DIRECT_COUNT {
            self.direct[index]
        } else if index < DIRECT_COUNT + INDIRECT_COUNT && self.has_indirect() {
            cache.read(self.indirect as usize, |block| {
                read_i16(block, (index - DIRECT_COUNT) * 2)
            })
        } else {
            NIL
        };

        (block_id >= 0).then_some(block_id as usize)
    }

    /// 把 `block_id` 登记为字节偏移所在的数据块
    pub fn allocate_block(
        &mut self,
        offset: usize,
        block_id: i16,
        cache: &BlockCacheManager,
    ) -> Result<(), AllocError> {
        let index = offset / BLOCK_SIZE;

        if index < DIRECT_COUNT {
            if self.direct[index] != NIL {
                return Err(AllocError::AlreadyAllocated);
            }
            if index > 0 && self.direct[index - 1] == NIL {
                return Err(AllocError::OutOfOrder);
            }
            self.direct[index] = block_id;
            return Ok(());
        }

        if index >= DIRECT_COUNT + INDIRECT_COUNT {
            return Err(AllocError::OutOfRange);
        }
        if !self.has_indirect() {
            return Err(AllocError::IndirectMissing);
        }

        let slot = (index - DIRECT_COUNT) * 2;
        cache.modify(self.indirect as usize, |block| {
            if read_i16(block, slot) != NIL {
                return Err(AllocError::AlreadyAllocated);
            }
            write_i16(block_id, block, slot);
            Ok(())
        })
    }

    /// 启用间接索引块，块内全部槽位置为 [`NIL`]
    pub fn allocate_indirect(
        &mut self,
        block_id: i16,
        cache: &BlockCacheManager,
    ) -> Result<(), IndirectError> {
        if self.direct.contains(&NIL) {
            return Err(IndirectError::NotReady);
        }
        if self.has_indirect() {
            return Err(IndirectError::AlreadyAllocated);
        }

        self.indirect = block_id;
        cache.modify(block_id as usize, |block| {
            for slot in 0..INDIRECT_COUNT {
                write_i16(NIL, block, slot * 2);
            }
        });

        Ok(())
    }

    /// 该 inode 占用的全部块：数据块在前，间接索引块(若有)在最后
    pub fn blocks(&self, cache: &BlockCacheManager) -> Vec<i16> {
        let mut blocks: Vec<i16> = self.direct.iter().copied().filter(|&b| b != NIL).collect();

        if self.has_indirect() {
            cache.read(self.indirect as usize, |block| {
                blocks.extend(
                    (0..INDIRECT_COUNT)
                        .map(|slot| read_i16(block, slot * 2))
                        .filter(|&b| b != NIL),
                );
            });
            blocks.push(self.indirect);
        }

        blocks
    }

    /// 已分配的块编号(含间接索引块)是否都落在 `region` 之内
    pub fn blocks_within(&self, region: Range<usize>, cache: &BlockCacheManager) -> bool {
        let inside = |block_id: i16| block_id == NIL || region.contains(&(block_id as usize));

        if !self.direct.iter().all(|&block_id| inside(block_id)) || !inside(self.indirect) {
            return false;
        }
        !self.has_indirect()
            || cache.read(self.indirect as usize, |block| {
                (0..INDIRECT_COUNT).all(|slot| inside(read_i16(block, slot * 2)))
            })
    }

    /// 清空所有索引与长度，返回原先占用的块，由调用者归还空闲链表
    pub fn clear(&mut self, cache: &BlockCacheManager) -> Vec<i16> {
        let blocks = self.blocks(cache);
        self.direct.fill(NIL);
        self.indirect = NIL;
        self.length = 0;
        blocks
    }
}
