//! # 块缓存层
//!
//! 块设备读写速度一般慢于内存读写速度，因此我们在内存中开辟缓冲区，
//! 把即将操作的块复制到内存中，提高对块设备的操作效率。
//! 同时，块缓存层也会尝试返回已缓存的块。
//!
//! 每个文件系统实例持有自己的 [`BlockCacheManager`]，
//! 使用者对块设备的操作都经过它，且**操作块时一定在缓冲区当中**。
//!
//! 缓存与块设备同步后并不会移除块缓存，该操作由缓存管理器调度执行。

use std::sync::Arc;

use block_dev::BlockDevice;
use spin::Mutex;

use crate::{BLOCK_SIZE, DataBlock};

/// 块缓存管理，缓存、调度块缓存
pub struct BlockCacheManager {
    /// 底层块设备的引用
    block_device: Arc<dyn BlockDevice>,
    queue: Mutex<Vec<(usize, Arc<Mutex<BlockCache>>)>>,
}

/// 内存中的块缓存
pub struct BlockCache {
    /// 缓存的数据
    data: DataBlock,
    /// 对应的块ID
    block_id: usize,
    block_device: Arc<dyn BlockDevice>,
    /// 是否为脏块
    modified: bool,
}

impl BlockCache {
    fn new(block_id: usize, block_device: Arc<dyn BlockDevice>) -> Self {
        let mut data = [0; BLOCK_SIZE];
        block_device.read_block(block_id, &mut data);

        Self {
            data,
            block_id,
            block_device,
            modified: false,
        }
    }

    pub fn sync(&mut self) {
        if self.modified {
            self.modified = false;
            self.block_device.write_block(self.block_id, &self.data);
        }
    }

    #[inline]
    pub fn map<V>(&self, f: impl FnOnce(&DataBlock) -> V) -> V {
        f(&self.data)
    }

    #[inline]
    pub fn map_mut<V>(&mut self, f: impl FnOnce(&mut DataBlock) -> V) -> V {
        self.modified = true;
        f(&mut self.data)
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        self.sync();
    }
}

impl BlockCacheManager {
    /// 块缓存个数的上限
    const CAPACITY: usize = 16;

    pub fn new(block_device: Arc<dyn BlockDevice>) -> Self {
        Self {
            block_device,
            queue: Mutex::new(Vec::with_capacity(Self::CAPACITY)),
        }
    }

    // 块缓存调度策略：踢走闲置块
    pub fn get(&self, block_id: usize) -> Arc<Mutex<BlockCache>> {
        let mut queue = self.queue.lock();

        // 尝试从缓冲区中读取块
        if let Some(cache) = queue
            .iter()
            .find_map(|(id, cache)| (block_id == *id).then_some(cache))
        {
            return Arc::clone(cache);
        };

        // 触及上限，写回一个没有其它引用的块；都被占用时暂时超出上限
        if queue.len() >= Self::CAPACITY {
            if let Some(index) = queue
                .iter()
                .position(|(_, cache)| Arc::strong_count(cache) == 1)
            {
                queue.remove(index);
            }
        }

        // 缓存新块
        let block_cache = Arc::new(Mutex::new(BlockCache::new(
            block_id,
            self.block_device.clone(),
        )));
        queue.push((block_id, block_cache.clone()));

        block_cache
    }

    /// 读出整块的某种映射
    #[inline]
    pub fn read<V>(&self, block_id: usize, f: impl FnOnce(&DataBlock) -> V) -> V {
        self.get(block_id).lock().map(f)
    }

    #[inline]
    pub fn modify<V>(&self, block_id: usize, f: impl FnOnce(&mut DataBlock) -> V) -> V {
        self.get(block_id).lock().map_mut(f)
    }

    pub fn sync_all(&self) {
        // 先取出引用再逐块写回，不在持有队列锁时等待块锁
        let caches: Vec<_> = self
            .queue
            .lock()
            .iter()
            .map(|(_, cache)| cache.clone())
            .collect();
        caches.iter().for_each(|cache| cache.lock().sync());
    }
}
