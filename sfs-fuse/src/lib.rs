
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use block_dev::BlockDevice;
use sfs::BLOCK_SIZE;

/// 以宿主机上的镜像文件充当块设备
#[derive(Debug)]
pub struct BlockFile(Mutex<File>);

impl BlockFile {
    pub fn new(fd: File) -> Self {
        Self(Mutex::new(fd))
    }

    /// 镜像文件所含的完整块数
    pub fn blocks(&self) -> std::io::Result<usize> {
        let file = self.0.lock().expect("block file poisoned");
        Ok(file.metadata()?.len() as usize / BLOCK_SIZE)
    }
}

impl BlockDevice for BlockFile {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        assert_eq!(buf.len(), BLOCK_SIZE, "not a complete block!");
        let mut file = self.0.lock().expect("block file poisoned");
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .expect("seeking error");
        file.read_exact(buf).expect("not a complete block!");
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        assert_eq!(buf.len(), BLOCK_SIZE, "not a complete block!");
        let mut file = self.0.lock().expect("block file poisoned");
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .expect("seeking error");
        file.write_all(buf).expect("not a complete block!");
    }
}
