/* sfs 的整体架构，自上而下 */

// 文件系统层：对外的打开、读写、定位、删除、格式化、同步
mod fs;

// 打开文件表层：句柄登记与每个 inode 的读写准入
mod file_table;

// 磁盘数据结构层：超级块、inode、目录的字节布局
mod layout;

// 块缓存层：内存上的磁盘块数据缓存
mod block_cache;

mod error;

pub use self::{
    error::{Error, Result},
    file_table::{Access, AccessState, Handle, OpenMode},
    fs::{DirEntry, FileSystem, Whence},
    layout::{DIRECT_COUNT, INDIRECT_COUNT, INODES_PER_BLOCK, MAX_FILE_SIZE, NAME_MAX_LEN},
};

pub const BLOCK_SIZE: usize = 512;

/// 挂载时发现布局不一致，重新格式化所用的 inode 数
pub const DEFAULT_INODES: usize = 64;

/// 盘上块地址只有 16 位
pub const MAX_BLOCKS: usize = i16::MAX as usize;

type DataBlock = [u8; BLOCK_SIZE];
