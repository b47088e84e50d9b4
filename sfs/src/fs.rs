//! # 文件系统层
//!
//! 把超级块、inode、目录与打开文件表组织起来，对外提供按名字打开、
//! 经句柄读写的全部操作。
//!
//! 目录本身是 0 号 inode 的内容：挂载时读出并解析，[`FileSystem::sync`] 时写回。

use std::sync::Arc;

use block_dev::BlockDevice;
use log::{debug, error, info, warn};
use spin::Mutex;

use crate::block_cache::BlockCacheManager;
use crate::file_table::FileTable;
use crate::layout::{
    data_start, read_i32, AllocError, Directory, Inode, SuperBlock, INODES_PER_BLOCK,
    MAX_FILE_SIZE, NIL_BLOCK,
};
use crate::{Error, Handle, OpenMode, Result, BLOCK_SIZE, DEFAULT_INODES, MAX_BLOCKS};

pub struct FileSystem {
    cache: BlockCacheManager,
    /// 空闲链表是全局唯一的资源，分配与回收都在此锁下进行
    super_block: Mutex<SuperBlock>,
    table: FileTable,
    total_blocks: usize,
}

/// [`FileSystem::seek`] 的基准位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

/// 目录中的一个文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub inode: u16,
    pub size: usize,
}

impl FileSystem {
    /// 挂载块设备；盘上元信息与 `total_blocks` 不符时按默认 inode 数重新格式化
    pub fn mount(block_device: Arc<dyn BlockDevice>, total_blocks: usize) -> Result<Self> {
        Self::attach(block_device, total_blocks, true)
    }

    /// 挂载已有的文件系统；布局不一致时返回 [`Error::CorruptLayout`]，不改动设备内容
    pub fn mount_existing(block_device: Arc<dyn BlockDevice>, total_blocks: usize) -> Result<Self> {
        Self::attach(block_device, total_blocks, false)
    }

    fn attach(
        block_device: Arc<dyn BlockDevice>,
        total_blocks: usize,
        reformat: bool,
    ) -> Result<Self> {
        if !(3..=MAX_BLOCKS).contains(&total_blocks) {
            return Err(Error::OutOfRange);
        }

        let cache = BlockCacheManager::new(block_device);
        let mut super_block = SuperBlock::load(&cache);
        if !Self::layout_is_sound(&super_block, total_blocks, &cache) {
            if !reformat {
                return Err(Error::CorruptLayout);
            }
            warn!("{}: reformatting", Error::CorruptLayout);
            let inodes = DEFAULT_INODES.min((total_blocks - 2) * INODES_PER_BLOCK);
            super_block.format(total_blocks, inodes, &cache);
        }

        let inodes = super_block.total_inodes as usize;
        let fs = Self {
            cache,
            super_block: Mutex::new(super_block),
            table: FileTable::new(Directory::new(inodes)),
            total_blocks,
        };

        // 重建目录
        let root = fs.open(Directory::ROOT, OpenMode::Read)?;
        let size = fs.fsize(&root)?;
        if size > 0 {
            let mut data = vec![0; size];
            let read = fs.read(&root, &mut data)?;
            if !fs.table.with_directory(|dir| dir.load(&data[..read])) {
                warn!("directory of {size} bytes doesn't fit {inodes} inodes, starting empty");
            }
        }
        fs.close(&root)?;

        info!("mounted: blocks={total_blocks} inodes={inodes}");
        fs.cache.sync_all();
        Ok(fs)
    }

    /// 打开文件。只有只读打开不存在的文件才会失败；
    /// 准入不满足时阻塞，直到其它句柄关闭。
    pub fn open(&self, filename: &str, mode: OpenMode) -> Result<Handle> {
        let handle = self.table.falloc(filename, mode, &self.cache)?;

        match mode {
            OpenMode::WriteTruncate => {
                let mut inode = handle.inode().write();
                let blocks = inode.clear(&self.cache);
                if !blocks.is_empty() {
                    debug!("truncating {filename:?}: {} blocks", blocks.len());
                    self.free_blocks(blocks);
                }
                inode.store(handle.inumber(), &self.cache);
            }
            OpenMode::Append => {
                let length = handle.inode().read().length as usize;
                handle.lock()?.seek = length;
            }
            OpenMode::Read | OpenMode::Write => {}
        }

        self.cache.sync_all();
        Ok(handle)
    }

    /// 从句柄的当前位置读满 `buf`，遇到文件末尾或未分配的块时提前结束
    pub fn read(&self, handle: &Handle, buf: &mut [u8]) -> Result<usize> {
        let mut entry = handle.lock()?;
        if !handle.mode().readable() {
            return Err(Error::ModeViolation);
        }

        let inode = handle.inode().read();
        let length = inode.length as usize;
        let mut read_size = 0;

        while read_size < buf.len() && entry.seek < length {
            let Some(block_id) = inode.resolve_block(entry.seek, &self.cache) else {
                break;
            };

            let offset = entry.seek % BLOCK_SIZE;
            let block_read_size = (BLOCK_SIZE - offset)
                .min(length - entry.seek)
                .min(buf.len() - read_size);
            let dest = &mut buf[read_size..read_size + block_read_size];
            self.cache.read(block_id, |block| {
                dest.copy_from_slice(&block[offset..offset + block_read_size])
            });

            read_size += block_read_size;
            entry.seek += block_read_size;
        }

        Ok(read_size)
    }

    /// 从句柄的当前位置写入 `buf`。
    /// 磁盘写满时只写入一部分，一个字节都没写成才返回错误。
    pub fn write(&self, handle: &Handle, buf: &[u8]) -> Result<usize> {
        let mut entry = handle.lock()?;
        if !handle.mode().writable() {
            return Err(Error::ModeViolation);
        }

        let mut inode = handle.inode().write();
        let mut written_size = 0;
        let mut failure = None;

        while written_size < buf.len() {
            if entry.seek >= MAX_FILE_SIZE {
                failure = Some(Error::OutOfRange);
                break;
            }

            let block_id = match inode.resolve_block(entry.seek, &self.cache) {
                Some(block_id) => block_id,
                None => match self.alloc_block(&mut inode, entry.seek) {
                    Ok(block_id) => block_id,
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                },
            };

            let offset = entry.seek % BLOCK_SIZE;
            let block_write_size = (BLOCK_SIZE - offset).min(buf.len() - written_size);
            let src = &buf[written_size..written_size + block_write_size];
            self.cache.modify(block_id, |block| {
                block[offset..offset + block_write_size].copy_from_slice(src)
            });

            written_size += block_write_size;
            entry.seek += block_write_size;
            if entry.seek > inode.length as usize {
                inode.length = entry.seek as i32;
            }
        }

        inode.store(handle.inumber(), &self.cache);
        self.cache.sync_all();

        match failure {
            Some(err) if written_size == 0 => Err(err),
            Some(err) => {
                warn!(
                    "short write on inode {}: {written_size}/{} bytes ({err})",
                    handle.inumber(),
                    buf.len()
                );
                Ok(written_size)
            }
            None => Ok(written_size),
        }
    }

    /// 移动句柄的读写位置，目标须落在 `[0, 文件大小]` 之内
    pub fn seek(&self, handle: &Handle, offset: i64, whence: Whence) -> Result<usize> {
        let mut entry = handle.lock()?;
        let length = handle.inode().read().length as i64;

        let base = match whence {
            Whence::Start => 0,
            Whence::Current => entry.seek as i64,
            Whence::End => length,
        };
        let target = base.checked_add(offset).ok_or(Error::OutOfRange)?;
        if !(0..=length).contains(&target) {
            return Err(Error::OutOfRange);
        }

        entry.seek = target as usize;
        Ok(entry.seek)
    }

    /// 复制句柄：两者共享读写位置，各自都需要关闭
    pub fn dup(&self, handle: &Handle) -> Result<Handle> {
        handle.lock()?.count += 1;
        Ok(handle.clone())
    }

    /// 关闭句柄；最后一个副本关闭时从打开文件表中注销
    pub fn close(&self, handle: &Handle) -> Result<()> {
        let count = {
            let mut entry = handle.lock()?;
            entry.count -= 1;
            entry.count
        };

        if count == 0 {
            self.table.ffree(handle, &self.cache)?;
            self.cache.sync_all();
        }
        Ok(())
    }

    /// 删除没有被任何句柄打开的文件，回收其全部数据块
    pub fn delete(&self, filename: &str) -> Result<()> {
        let (inumber, inode) = self.table.claim(filename, &self.cache)?;

        {
            let mut inode = inode.write();
            let blocks = inode.clear(&self.cache);
            info!("deleting {filename:?}: inode {inumber}, {} blocks", blocks.len());
            self.free_blocks(blocks);
        }
        self.table.release_deleted(inumber, &self.cache);

        self.cache.sync_all();
        Ok(())
    }

    /// 以 `max_files` 个 inode 重新格式化，要求没有打开着的句柄
    pub fn format(&self, max_files: usize) -> Result<()> {
        if max_files == 0
            || data_start(max_files) >= self.total_blocks
            || Directory::serialized_len(max_files) > MAX_FILE_SIZE
        {
            return Err(Error::OutOfRange);
        }

        self.table.reformat(Directory::new(max_files), || {
            self.super_block
                .lock()
                .format(self.total_blocks, max_files, &self.cache);
        })?;

        info!("formatted with {max_files} inodes");
        self.cache.sync_all();
        Ok(())
    }

    /// 把目录写入 0 号 inode，再写回超级块
    pub fn sync(&self) -> Result<()> {
        let data = self.table.with_directory(|dir| dir.to_bytes());

        let root = self.open(Directory::ROOT, OpenMode::Write)?;
        let written = self.write(&root, &data);
        self.close(&root)?;
        if written? < data.len() {
            return Err(Error::DiskFull);
        }

        self.super_block.lock().sync(&self.cache);
        self.cache.sync_all();
        Ok(())
    }

    pub fn fsize(&self, handle: &Handle) -> Result<usize> {
        let _entry = handle.lock()?;
        Ok(handle.inode().read().length as usize)
    }

    /// 目录中的全部文件
    pub fn list(&self) -> Vec<DirEntry> {
        let entries: Vec<_> = self.table.with_directory(|dir| dir.entries().collect());
        entries
            .into_iter()
            .map(|(inode, name)| DirEntry {
                name,
                inode,
                size: Inode::load(inode, &self.cache).length as usize,
            })
            .collect()
    }

    /// 空闲链表上的块数
    pub fn free_blocks_count(&self) -> usize {
        let super_block = self.super_block.lock();
        let mut count = 0;
        let mut next = super_block.free_list;
        while next != NIL_BLOCK && count < self.total_blocks {
            count += 1;
            next = self.cache.read(next as usize, |block| read_i32(block, 0));
        }
        count
    }

    #[inline]
    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    #[inline]
    pub fn total_inodes(&self) -> usize {
        self.super_block.lock().total_inodes as usize
    }
}

impl FileSystem {
    /// 超级块与设备吻合，且 0 号 inode 的长度与块编号都可信
    fn layout_is_sound(super_block: &SuperBlock, total_blocks: usize, cache: &BlockCacheManager) -> bool {
        if !super_block.is_consistent(total_blocks) {
            return false;
        }

        let inodes = super_block.total_inodes as usize;
        let root = Inode::load(0, cache);
        // 目录要么从未写回，要么恰好占满全部槽位
        let length = root.length as usize;
        (root.length == 0 || length == Directory::serialized_len(inodes))
            && root.blocks_within(data_start(inodes)..total_blocks, cache)
    }

    /// 为 inode 在 `offset` 处分配数据块，必要时先分配间接索引块
    fn alloc_block(&self, inode: &mut Inode, offset: usize) -> Result<usize> {
        let mut super_block = self.super_block.lock();

        let block_id = super_block.find_free_block(&self.cache);
        if block_id == NIL_BLOCK {
            return Err(Error::DiskFull);
        }

        let result = match inode.allocate_block(offset, block_id as i16, &self.cache) {
            Err(AllocError::IndirectMissing) => {
                let indirect = super_block.find_free_block(&self.cache);
                if indirect == NIL_BLOCK {
                    super_block.add_free_block(block_id, &self.cache);
                    return Err(Error::DiskFull);
                }
                if let Err(err) = inode.allocate_indirect(indirect as i16, &self.cache) {
                    error!("indirect block refused at offset {offset}: {err:?}");
                    super_block.add_free_block(indirect, &self.cache);
                    super_block.add_free_block(block_id, &self.cache);
                    return Err(Error::CorruptLayout);
                }
                debug!("indirect block {indirect} allocated");
                inode.allocate_block(offset, block_id as i16, &self.cache)
            }
            result => result,
        };

        if let Err(err) = result {
            error!("block allocation refused at offset {offset}: {err:?}");
            super_block.add_free_block(block_id, &self.cache);
            return Err(Error::CorruptLayout);
        }

        super_block.sync(&self.cache);
        Ok(block_id as usize)
    }

    fn free_blocks(&self, blocks: Vec<i16>) {
        let mut super_block = self.super_block.lock();
        for block_id in blocks {
            super_block.add_free_block(block_id as i32, &self.cache);
        }
        super_block.sync(&self.cache);
    }
}
