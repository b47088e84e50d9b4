//! # 打开文件表层
//!
//! 记录所有打开着的句柄，并为每个被打开的 inode 维护读写准入：
//! 多个读者可以并存；写者(含追加)独占；
//! 有写者排队时不再放行新的读者，避免写者饿死。
//!
//! 准入不满足时打开者在条件变量上睡眠，
//! 任何一次打开或关闭改变了 inode 的状态都会唤醒全部睡眠者重新判断。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use enumflags2::{bitflags, BitFlags};
use log::{debug, trace};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::block_cache::BlockCacheManager;
use crate::layout::{Directory, Inode};
use crate::{Error, Result};

/// 打开方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenMode {
    /// 只读，文件须已存在
    Read,
    /// 只写，从头覆盖
    Write,
    /// 先清空文件，可读可写
    WriteTruncate,
    /// 只写，从文件末尾开始
    Append,
}

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read = 0b01,
    Write = 0b10,
}

/// inode 的读写准入状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessState {
    /// 没有句柄
    #[default]
    Closed,
    /// 若干读者
    SharedRead(u16),
    /// 唯一的写者
    ExclusiveWrite,
    /// 有写者在等待当前持有者离开
    WritePending,
}

/// 打开文件表的一项
pub struct FileTableEntry {
    id: u64,
    inumber: u16,
    mode: OpenMode,
    inode: Arc<RwLock<Inode>>,
    inner: Mutex<EntryInner>,
}

#[derive(Debug)]
pub(crate) struct EntryInner {
    /// 下一次读写的字节偏移
    pub seek: usize,
    /// 共享此项的句柄数，归零后此项失效
    pub count: u32,
}

/// 打开文件的句柄
///
/// 克隆得到的句柄与原句柄是同一个打开文件；
/// 想要独立计数的副本请用 [`FileSystem::dup`](crate::FileSystem::dup)。
#[derive(Clone)]
pub struct Handle(Arc<FileTableEntry>);

/// 被打开的 inode 在内存中的唯一副本及其准入计数
struct OpenInode {
    /// 区分同一 inode 编号先后的槽位：删除会丢弃槽位，编号随后可能被新文件复用
    generation: u64,
    inode: Arc<RwLock<Inode>>,
    readers: u16,
    writer: bool,
    pending_writers: u16,
    /// 登记在表中的项数
    handles: u16,
}

struct TableInner {
    directory: Directory,
    entries: HashMap<u64, Arc<FileTableEntry>>,
    inodes: HashMap<u16, OpenInode>,
    next_id: u64,
    next_generation: u64,
}

pub struct FileTable {
    inner: Mutex<TableInner>,
    /// 任一 inode 的准入状态改变
    changed: Condvar,
}

impl OpenMode {
    pub fn access(self) -> BitFlags<Access> {
        match self {
            Self::Read => Access::Read.into(),
            Self::Write | Self::Append => Access::Write.into(),
            Self::WriteTruncate => Access::Read | Access::Write,
        }
    }

    #[inline]
    pub fn readable(self) -> bool {
        self.access().contains(Access::Read)
    }

    #[inline]
    pub fn writable(self) -> bool {
        self.access().contains(Access::Write)
    }

    /// 除只读外都需要独占 inode
    #[inline]
    fn exclusive(self) -> bool {
        self != Self::Read
    }
}

impl TryFrom<&str> for OpenMode {
    type Error = Error;

    fn try_from(mode: &str) -> Result<Self> {
        match mode {
            "r" => Ok(Self::Read),
            "w" => Ok(Self::Write),
            "w+" => Ok(Self::WriteTruncate),
            "a" => Ok(Self::Append),
            _ => Err(Error::ModeViolation),
        }
    }
}

impl AccessState {
    /// 盘上的状态标记
    pub fn tag(self) -> i16 {
        match self {
            Self::Closed => 0,
            Self::SharedRead(_) => 1,
            Self::ExclusiveWrite => 2,
            Self::WritePending => 3,
        }
    }

    /// 读者数不单独存放，取自 inode 的句柄数
    pub fn from_tag(tag: i16, open_count: i16) -> Self {
        match tag {
            1 => Self::SharedRead(open_count.max(1) as u16),
            2 => Self::ExclusiveWrite,
            3 => Self::WritePending,
            _ => Self::Closed,
        }
    }
}

impl Handle {
    #[inline]
    pub fn inumber(&self) -> u16 {
        self.0.inumber
    }

    #[inline]
    pub fn mode(&self) -> OpenMode {
        self.0.mode
    }

    #[inline]
    pub(crate) fn inode(&self) -> &RwLock<Inode> {
        &self.0.inode
    }

    /// 锁住句柄，已关闭的句柄视为无效
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, EntryInner>> {
        let inner = self.0.inner.lock();
        if inner.count == 0 {
            return Err(Error::InvalidHandle);
        }
        Ok(inner)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.0.id)
            .field("inumber", &self.0.inumber)
            .field("mode", &self.0.mode)
            .finish()
    }
}

impl OpenInode {
    fn new(inode: Inode, generation: u64) -> Self {
        Self {
            generation,
            inode: Arc::new(RwLock::new(inode)),
            readers: 0,
            writer: false,
            pending_writers: 0,
            handles: 0,
        }
    }

    fn state(&self) -> AccessState {
        if self.pending_writers > 0 {
            AccessState::WritePending
        } else if self.writer {
            AccessState::ExclusiveWrite
        } else if self.readers > 0 {
            AccessState::SharedRead(self.readers)
        } else {
            AccessState::Closed
        }
    }

    fn admits(&self, mode: OpenMode) -> bool {
        if mode.exclusive() {
            !self.writer && self.readers == 0
        } else {
            !self.writer && self.pending_writers == 0
        }
    }

    /// 把准入状态与句柄数写回盘上 inode
    fn persist(&self, inumber: u16, cache: &BlockCacheManager) {
        let mut inode = self.inode.write();
        inode.open_count = self.handles as i16;
        inode.state = self.state();
        inode.store(inumber, cache);
    }

    fn idle(&self) -> bool {
        self.handles == 0 && self.pending_writers == 0
    }
}

impl TableInner {
    fn new_slot(&mut self, inode: Inode) -> OpenInode {
        self.next_generation += 1;
        OpenInode::new(inode, self.next_generation)
    }
}

impl FileTable {
    pub fn new(directory: Directory) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                directory,
                entries: HashMap::new(),
                inodes: HashMap::new(),
                next_id: 0,
                next_generation: 0,
            }),
            changed: Condvar::new(),
        }
    }

    /// 为文件分配一个表项；文件不存在且不是只读时创建之。
    /// 准入不满足时阻塞，直到其它句柄关闭。
    pub fn falloc(&self, filename: &str, mode: OpenMode, cache: &BlockCacheManager) -> Result<Handle> {
        if filename.is_empty() {
            return Err(Error::NameNotFound);
        }

        let mut inner = self.inner.lock();
        // 本线程登记为等待写者的 inode 编号及其槽位
        let mut pending_on: Option<(u16, u64)> = None;

        let inumber = loop {
            let found = if filename == Directory::ROOT {
                Some(0)
            } else {
                inner.directory.namei(filename)
            };

            // 睡眠期间文件被删除，或编号已换成新的槽位，登记作废
            if let Some((inumber, generation)) = pending_on {
                let current = inner.inodes.get(&inumber).map(|slot| slot.generation);
                if found != Some(inumber) || current != Some(generation) {
                    Self::unmark_pending(&mut inner, inumber, generation, cache);
                    pending_on = None;
                }
            }

            let Some(inumber) = found else {
                if !mode.exclusive() {
                    return Err(Error::NameNotFound);
                }
                let inumber = inner
                    .directory
                    .ialloc(filename)
                    .ok_or(Error::DirectoryFull)?;
                debug!("created {filename:?} as inode {inumber}");
                let fresh = Inode::default();
                fresh.store(inumber, cache);
                let slot = inner.new_slot(fresh);
                inner.inodes.insert(inumber, slot);
                break inumber;
            };

            if !inner.inodes.contains_key(&inumber) {
                let slot = inner.new_slot(Inode::load(inumber, cache));
                inner.inodes.insert(inumber, slot);
            }
            let Some(slot) = inner.inodes.get_mut(&inumber) else {
                unreachable!("slot of inode {inumber} just inserted");
            };
            if slot.admits(mode) {
                break inumber;
            }

            if mode.exclusive() && pending_on.is_none() {
                slot.pending_writers += 1;
                slot.persist(inumber, cache);
                pending_on = Some((inumber, slot.generation));
            }
            trace!("{filename:?} busy ({:?}), waiting", slot.state());
            self.changed.wait(&mut inner);
        };

        let TableInner {
            inodes,
            entries,
            next_id,
            ..
        } = &mut *inner;
        let Some(slot) = inodes.get_mut(&inumber) else {
            unreachable!("admitted inode {inumber} without a slot");
        };
        if mode.exclusive() {
            if pending_on.is_some() {
                slot.pending_writers -= 1;
            }
            slot.writer = true;
        } else {
            slot.readers += 1;
        }
        slot.handles += 1;
        slot.persist(inumber, cache);

        let entry = Arc::new(FileTableEntry {
            id: *next_id,
            inumber,
            mode,
            inode: slot.inode.clone(),
            inner: Mutex::new(EntryInner { seek: 0, count: 1 }),
        });
        *next_id += 1;
        entries.insert(entry.id, entry.clone());

        Ok(Handle(entry))
    }

    /// 注销表项，释放其对 inode 的占用并唤醒等待者
    pub fn ffree(&self, handle: &Handle, cache: &BlockCacheManager) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .remove(&handle.0.id)
            .ok_or(Error::InvalidHandle)?;

        let inumber = entry.inumber;
        let Some(slot) = inner.inodes.get_mut(&inumber) else {
            return Err(Error::InvalidHandle);
        };
        if entry.mode.exclusive() {
            slot.writer = false;
        } else {
            slot.readers -= 1;
        }
        slot.handles -= 1;
        slot.persist(inumber, cache);
        if slot.idle() {
            inner.inodes.remove(&inumber);
        }
        drop(inner);

        self.changed.notify_all();
        Ok(())
    }

    /// 表中是否没有任何句柄
    #[cfg(test)]
    pub fn fempty(&self) -> bool {
        let inner = self.inner.lock();
        inner.entries.is_empty() && inner.inodes.is_empty()
    }

    /// 为删除独占一个没有任何句柄的文件
    pub fn claim(&self, filename: &str, cache: &BlockCacheManager) -> Result<(u16, Arc<RwLock<Inode>>)> {
        let mut inner = self.inner.lock();
        let inumber = inner
            .directory
            .namei(filename)
            .ok_or(Error::NameNotFound)?;
        if inumber == 0 || inner.inodes.contains_key(&inumber) {
            return Err(Error::FileBusy);
        }

        let mut slot = inner.new_slot(Inode::load(inumber, cache));
        slot.writer = true;
        slot.handles = 1;
        let inode = slot.inode.clone();
        inner.inodes.insert(inumber, slot);

        Ok((inumber, inode))
    }

    /// 结束删除：释放目录项，写回清空的 inode
    pub fn release_deleted(&self, inumber: u16, cache: &BlockCacheManager) {
        let mut inner = self.inner.lock();
        inner.inodes.remove(&inumber);
        inner.directory.ifree(inumber);
        Inode::default().store(inumber, cache);
        drop(inner);

        self.changed.notify_all();
    }

    /// 表为空时执行 `f` 并换上新的目录
    pub fn reformat(&self, directory: Directory, f: impl FnOnce()) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.entries.is_empty() || !inner.inodes.is_empty() {
            return Err(Error::FileBusy);
        }

        f();
        inner.directory = directory;
        Ok(())
    }

    #[inline]
    pub fn with_directory<V>(&self, f: impl FnOnce(&mut Directory) -> V) -> V {
        f(&mut self.inner.lock().directory)
    }

    /// inode 当前的准入状态
    #[cfg(test)]
    pub fn state(&self, inumber: u16) -> AccessState {
        self.inner
            .lock()
            .inodes
            .get(&inumber)
            .map_or(AccessState::Closed, OpenInode::state)
    }

    /// 撤销等待登记；所登记的槽位已被删除丢弃时无事可做
    fn unmark_pending(
        inner: &mut TableInner,
        inumber: u16,
        generation: u64,
        cache: &BlockCacheManager,
    ) {
        if let Some(slot) = inner
            .inodes
            .get_mut(&inumber)
            .filter(|slot| slot.generation == generation)
        {
            slot.pending_writers -= 1;
            slot.persist(inumber, cache);
            if slot.idle() {
                inner.inodes.remove(&inumber);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use block_dev::RamDisk;

    use super::*;
    use crate::BLOCK_SIZE;

    fn setup() -> (FileTable, BlockCacheManager) {
        let cache = BlockCacheManager::new(Arc::new(RamDisk::new(BLOCK_SIZE, 8)));
        (FileTable::new(Directory::new(4)), cache)
    }

    #[test]
    fn mode_access() {
        assert!(OpenMode::Read.readable() && !OpenMode::Read.writable());
        assert!(!OpenMode::Write.readable() && OpenMode::Write.writable());
        assert!(!OpenMode::Append.readable() && OpenMode::Append.writable());
        assert!(OpenMode::WriteTruncate.readable() && OpenMode::WriteTruncate.writable());
        assert_eq!(OpenMode::try_from("w+"), Ok(OpenMode::WriteTruncate));
        assert_eq!(OpenMode::try_from("x"), Err(Error::ModeViolation));
    }

    #[test]
    fn readers_share_writers_exclude() {
        let (table, cache) = setup();
        assert_eq!(
            table.falloc("f", OpenMode::Read, &cache).unwrap_err(),
            Error::NameNotFound
        );

        let writer = table.falloc("f", OpenMode::Write, &cache).unwrap();
        assert_eq!(writer.inumber(), 1);
        assert_eq!(table.state(1), AccessState::ExclusiveWrite);
        table.ffree(&writer, &cache).unwrap();
        assert_eq!(table.state(1), AccessState::Closed);
        assert!(table.fempty());

        let r1 = table.falloc("f", OpenMode::Read, &cache).unwrap();
        let r2 = table.falloc("f", OpenMode::Read, &cache).unwrap();
        assert_eq!(table.state(1), AccessState::SharedRead(2));

        let stored = Inode::load(1, &cache);
        assert_eq!(stored.open_count, 2);
        assert_eq!(stored.state, AccessState::SharedRead(2));

        table.ffree(&r1, &cache).unwrap();
        assert_eq!(table.state(1), AccessState::SharedRead(1));
        assert_eq!(table.ffree(&r1, &cache), Err(Error::InvalidHandle));
        table.ffree(&r2, &cache).unwrap();
        assert!(table.fempty());
        assert_eq!(Inode::load(1, &cache).state, AccessState::Closed);
    }

    #[test]
    fn root_resolves_to_inode_zero() {
        let (table, cache) = setup();
        let root = table.falloc("/", OpenMode::Read, &cache).unwrap();
        assert_eq!(root.inumber(), 0);
        table.ffree(&root, &cache).unwrap();
    }

    #[test]
    fn directory_exhaustion() {
        let (table, cache) = setup();
        for name in ["a", "b", "c"] {
            let handle = table.falloc(name, OpenMode::Append, &cache).unwrap();
            table.ffree(&handle, &cache).unwrap();
        }
        assert_eq!(
            table.falloc("d", OpenMode::Write, &cache).unwrap_err(),
            Error::DirectoryFull
        );
    }

    #[test]
    fn claim_refuses_open_files() {
        let (table, cache) = setup();
        let handle = table.falloc("f", OpenMode::Write, &cache).unwrap();
        assert_eq!(table.claim("f", &cache).unwrap_err(), Error::FileBusy);
        assert_eq!(table.claim("/", &cache).unwrap_err(), Error::FileBusy);
        assert_eq!(table.claim("g", &cache).unwrap_err(), Error::NameNotFound);
        table.ffree(&handle, &cache).unwrap();

        let (inumber, _inode) = table.claim("f", &cache).unwrap();
        assert!(!table.fempty());
        table.release_deleted(inumber, &cache);
        assert!(table.fempty());
        assert_eq!(table.with_directory(|dir| dir.namei("f")), None);
    }

    /// 等待 `filename` 的写者登记完毕
    fn wait_for_pending(table: &FileTable, inumber: u16) {
        while table.state(inumber) != AccessState::WritePending {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    /// 删除丢弃槽位，但先不唤醒睡眠者
    fn drop_slot(table: &FileTable, inumber: u16, cache: &BlockCacheManager) {
        let mut inner = table.inner.lock();
        inner.inodes.remove(&inumber);
        inner.directory.ifree(inumber);
        Inode::default().store(inumber, cache);
    }

    #[test]
    fn waiter_survives_inode_reuse_by_another_name() {
        let (table, cache) = setup();
        let handle = table.falloc("a", OpenMode::Write, &cache).unwrap();
        table.ffree(&handle, &cache).unwrap();
        let (inumber, _inode) = table.claim("a", &cache).unwrap();

        std::thread::scope(|s| {
            let waiter = s.spawn(|| table.falloc("a", OpenMode::Write, &cache));
            wait_for_pending(&table, inumber);

            drop_slot(&table, inumber, &cache);
            let other = table.falloc("b", OpenMode::Write, &cache).unwrap();
            assert_eq!(other.inumber(), inumber);
            table.changed.notify_all();

            // 等待者重新创建了 "a"，占用另一个编号
            let recreated = waiter.join().unwrap().unwrap();
            assert_ne!(recreated.inumber(), inumber);
            assert_eq!(table.state(inumber), AccessState::ExclusiveWrite);

            table.ffree(&other, &cache).unwrap();
            table.ffree(&recreated, &cache).unwrap();
        });

        assert!(table.fempty());
        let reader = table.falloc("b", OpenMode::Read, &cache).unwrap();
        assert_eq!(table.state(inumber), AccessState::SharedRead(1));
        table.ffree(&reader, &cache).unwrap();
    }

    #[test]
    fn waiter_survives_inode_reuse_by_same_name() {
        let (table, cache) = setup();
        let handle = table.falloc("a", OpenMode::Write, &cache).unwrap();
        table.ffree(&handle, &cache).unwrap();
        let (inumber, _inode) = table.claim("a", &cache).unwrap();

        std::thread::scope(|s| {
            let waiter = s.spawn(|| table.falloc("a", OpenMode::Write, &cache));
            wait_for_pending(&table, inumber);

            drop_slot(&table, inumber, &cache);
            let creator = table.falloc("a", OpenMode::Write, &cache).unwrap();
            assert_eq!(creator.inumber(), inumber);
            table.changed.notify_all();

            // 等待者在新的槽位上重新登记
            wait_for_pending(&table, inumber);
            table.ffree(&creator, &cache).unwrap();

            let next = waiter.join().unwrap().unwrap();
            assert_eq!(next.inumber(), inumber);
            assert_eq!(table.state(inumber), AccessState::ExclusiveWrite);
            table.ffree(&next, &cache).unwrap();
        });

        assert!(table.fempty());
    }

    #[test]
    fn reformat_requires_empty_table() {
        let (table, cache) = setup();
        let handle = table.falloc("f", OpenMode::Write, &cache).unwrap();
        assert_eq!(
            table.reformat(Directory::new(2), || panic!("must not run")),
            Err(Error::FileBusy)
        );
        table.ffree(&handle, &cache).unwrap();
        table.reformat(Directory::new(2), || ()).unwrap();
        assert_eq!(table.with_directory(|dir| dir.capacity()), 2);
    }
}
