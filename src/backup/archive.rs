//! zip 归档读写（同步，调用方放到 blocking 线程池）

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path};

use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::BackupError;

/// 把 `src` 目录树完整写入 `archive_path`，条目路径相对于 `src`；返回写入的文件数
pub fn write_archive(src: &Path, archive_path: &Path) -> Result<usize, BackupError> {
    let file = File::create(archive_path)?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut files = 0;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry?;
        let rel = match entry.path().strip_prefix(src) {
            Ok(rel) if rel.as_os_str().is_empty() => continue,
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let name = entry_name(rel);

        if entry.file_type().is_dir() {
            // 空目录也要保留
            zip.add_directory(name, options)?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options)?;
            let mut input = File::open(entry.path())?;
            io::copy(&mut input, &mut zip)?;
            files += 1;
        }
    }

    zip.finish()?;
    Ok(files)
}

/// 解压到 `dest`；带 `..` 或绝对路径的条目会被跳过
pub fn extract_archive(archive_path: &Path, dest: &Path) -> Result<usize, BackupError> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;

    let mut files = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(rel) = entry.enclosed_name().map(Path::to_path_buf) else {
            tracing::warn!(entry = entry.name(), "Skipping unsafe archive entry");
            continue;
        };
        let out = dest.join(rel);

        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut output = File::create(&out)?;
        io::copy(&mut entry, &mut output)?;
        files += 1;
    }
    Ok(files)
}

/// zip 条目统一使用 `/` 分隔
fn entry_name(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
