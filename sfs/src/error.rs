use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// 句柄已被释放
    #[error("invalid file handle")]
    InvalidHandle,
    /// 在只写句柄上读，或在只读句柄上写
    #[error("operation not permitted by the open mode")]
    ModeViolation,
    #[error("value out of range")]
    OutOfRange,
    #[error("no free block left on the device")]
    DiskFull,
    #[error("no free inode left in the directory")]
    DirectoryFull,
    #[error("no such file")]
    NameNotFound,
    /// 删除时仍有其它句柄打开着该文件
    #[error("file is in use")]
    FileBusy,
    #[error("inconsistent on-disk layout")]
    CorruptLayout,
}
