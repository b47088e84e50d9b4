use log::{debug, error};

use super::{data_start, read_i32, write_i32, Directory, Inode, MAX_FILE_SIZE, NIL_BLOCK};
use crate::block_cache::BlockCacheManager;

/// 超级块：
/// - 记录设备块数与 inode 数，定位各区域；
/// - 持有空闲链表的表头，负责数据块的分配与回收
///
/// 盘上布局(0 号块开头)：`total_blocks`(4) `total_inodes`(4) `free_list`(4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    pub total_blocks: i32,
    pub total_inodes: i32,
    /// 空闲链表表头，用尽时为 [`NIL_BLOCK`]
    pub free_list: i32,
}

impl SuperBlock {
    pub const SIZE: usize = 12;

    pub fn load(cache: &BlockCacheManager) -> Self {
        cache.read(0, |block| Self::from_bytes(block))
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            total_blocks: read_i32(buf, 0),
            total_inodes: read_i32(buf, 4),
            free_list: read_i32(buf, 8),
        }
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        write_i32(self.total_blocks, buf, 0);
        write_i32(self.total_inodes, buf, 4);
        write_i32(self.free_list, buf, 8);
    }

    /// 盘上的元信息是否与期望的设备大小吻合
    pub fn is_consistent(&self, total_blocks: usize) -> bool {
        if self.total_blocks as usize != total_blocks || self.total_inodes <= 0 {
            return false;
        }
        // 目录须装得进 0 号 inode
        if Directory::serialized_len(self.total_inodes as usize) > MAX_FILE_SIZE {
            return false;
        }

        let data_start = data_start(self.total_inodes as usize);
        data_start <= total_blocks
            && (self.free_list == NIL_BLOCK
                || (data_start..total_blocks).contains(&(self.free_list as usize)))
    }

    /// 写入 `inodes` 个空 inode，并把其后的全部数据块按递增顺序串成空闲链表
    pub fn format(&mut self, total_blocks: usize, inodes: usize, cache: &BlockCacheManager) {
        self.total_blocks = total_blocks as i32;
        self.total_inodes = inodes as i32;

        for inumber in 0..inodes {
            Inode::default().store(inumber as u16, cache);
        }

        let data_start = data_start(inodes);
        for block_id in data_start..total_blocks {
            let next = if block_id + 1 < total_blocks {
                (block_id + 1) as i32
            } else {
                NIL_BLOCK
            };
            cache.modify(block_id, |block| {
                block.fill(0);
                write_i32(next, block, 0);
            });
        }
        self.free_list = if data_start < total_blocks {
            data_start as i32
        } else {
            NIL_BLOCK
        };

        debug!(
            "formatted: blocks={total_blocks} inodes={inodes} free_list={}",
            self.free_list
        );
        self.sync(cache);
    }

    /// 弹出空闲链表的表头；链表为空时返回 [`NIL_BLOCK`]
    pub fn find_free_block(&mut self, cache: &BlockCacheManager) -> i32 {
        let block_id = self.free_list;
        if block_id == NIL_BLOCK {
            return NIL_BLOCK;
        }
        if !(0..self.total_blocks).contains(&block_id) {
            error!("free list head {block_id} lies outside the device");
            return NIL_BLOCK;
        }

        self.free_list = cache.modify(block_id as usize, |block| {
            let next = read_i32(block, 0);
            write_i32(0, block, 0);
            next
        });

        block_id
    }

    /// 把块压回空闲链表的表头，负数地址忽略
    pub fn add_free_block(&mut self, block_id: i32, cache: &BlockCacheManager) {
        if block_id < 0 {
            return;
        }

        let next = self.free_list;
        cache.modify(block_id as usize, |block| {
            block.fill(0);
            write_i32(next, block, 0);
        });
        self.free_list = block_id;
    }

    pub fn sync(&self, cache: &BlockCacheManager) {
        cache.modify(0, |block| self.write_to(block));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use block_dev::RamDisk;

    use super::*;
    use crate::BLOCK_SIZE;

    fn setup(blocks: usize, inodes: usize) -> (SuperBlock, BlockCacheManager) {
        let cache = BlockCacheManager::new(Arc::new(RamDisk::new(BLOCK_SIZE, blocks)));
        let mut sb = SuperBlock::load(&cache);
        sb.format(blocks, inodes, &cache);
        (sb, cache)
    }

    #[test]
    fn format_chains_every_data_block() {
        let (sb, cache) = setup(32, 8);
        assert_eq!(sb.free_list, 2);
        assert!(sb.is_consistent(32));

        let mut chain = Vec::new();
        let mut next = sb.free_list;
        while next != NIL_BLOCK {
            chain.push(next);
            next = cache.read(next as usize, |block| read_i32(block, 0));
        }
        assert_eq!(chain, (2..32).collect::<Vec<_>>());
        assert_eq!(SuperBlock::load(&cache), sb);
    }

    #[test]
    fn pop_and_push() {
        let (mut sb, cache) = setup(8, 16);
        assert_eq!(sb.find_free_block(&cache), 2);
        assert_eq!(sb.find_free_block(&cache), 3);
        assert_eq!(cache.read(2, |block| read_i32(block, 0)), 0);

        sb.add_free_block(2, &cache);
        sb.add_free_block(-1, &cache);
        assert_eq!(sb.free_list, 2);
        assert_eq!(sb.find_free_block(&cache), 2);
        assert_eq!(sb.find_free_block(&cache), 4);
    }

    #[test]
    fn exhaustion_returns_sentinel() {
        let (mut sb, cache) = setup(4, 16);
        assert_eq!(sb.find_free_block(&cache), 2);
        assert_eq!(sb.find_free_block(&cache), 3);
        assert_eq!(sb.find_free_block(&cache), NIL_BLOCK);
        assert_eq!(sb.find_free_block(&cache), NIL_BLOCK);
    }

    #[test]
    fn inconsistent_metadata() {
        let (sb, _cache) = setup(32, 8);
        assert!(!sb.is_consistent(64));

        let broken = SuperBlock {
            free_list: 1,
            ..sb
        };
        assert!(!broken.is_consistent(32));
        let blank = SuperBlock::from_bytes(&[0; SuperBlock::SIZE]);
        assert!(!blank.is_consistent(32));

        let crowded = SuperBlock {
            total_blocks: 32767,
            total_inodes: 70000,
            free_list: NIL_BLOCK,
        };
        assert!(!crowded.is_consistent(32767));
        let roomy = SuperBlock {
            total_inodes: (MAX_FILE_SIZE / Directory::serialized_len(1)) as i32,
            ..crowded
        };
        assert!(roomy.is_consistent(32767));
    }
}
