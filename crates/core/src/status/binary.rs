//! Binary/text classification.
//!
//! Known extensions decide first; otherwise the first 8 KiB of content are
//! sniffed (a NUL byte or invalid UTF-8 means binary). A path with an
//! unknown extension that cannot be read is treated as text.

use std::fs::File;
use std::io::Read;
use std::path::Path;

const SNIFF_LEN: usize = 8 * 1024;

const BINARY_EXTENSIONS: &[&str] = &[
    // images
    "png", "jpg", "jpeg", "gif", "bmp", "tga", "tif", "tiff", "psd", "exr", "hdr", "ico", "webp",
    "dds", "ktx",
    // 3d / engine assets
    "fbx", "blend", "max", "ma", "mb", "uasset", "umap", "unity", "prefab", "asset",
    // audio / video
    "wav", "mp3", "ogg", "flac", "aiff", "mp4", "mov", "avi", "mkv", "webm",
    // archives
    "zip", "7z", "rar", "gz", "tgz", "bz2", "xz", "tar", "pak",
    // executables and libraries
    "exe", "dll", "so", "dylib", "lib", "a", "o", "obj", "pdb", "bin", "dat", "class", "jar",
    // documents and fonts
    "pdf", "doc", "docx", "xls", "xlsx", "ttf", "otf", "woff", "woff2",
];

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "rst", "rs", "c", "h", "cc", "cpp", "hpp", "cs", "java", "kt", "go", "py", "rb",
    "js", "ts", "tsx", "jsx", "json", "toml", "yaml", "yml", "xml", "html", "css", "scss", "ini",
    "cfg", "conf", "sh", "bat", "ps1", "lua", "glsl", "hlsl", "shader", "usf", "ush", "sql",
    "csv", "svg",
];

/// Classification by extension alone; `None` when the extension is unknown.
pub fn classify_extension(path: &Path) -> Option<bool> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if BINARY_EXTENSIONS.contains(&ext.as_str()) {
        Some(true)
    } else if TEXT_EXTENSIONS.contains(&ext.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// `true` if the bytes look like binary content.
pub fn is_binary_content(data: &[u8]) -> bool {
    let sample = &data[..data.len().min(SNIFF_LEN)];
    if sample.contains(&0) {
        return true;
    }
    match std::str::from_utf8(sample) {
        Ok(_) => false,
        // A multi-byte character cut off by the sample boundary is fine.
        Err(e) => e.error_len().is_some(),
    }
}

/// Classify a file on disk.
pub fn is_binary(abs_path: &Path) -> bool {
    if let Some(binary) = classify_extension(abs_path) {
        return binary;
    }
    let Ok(file) = File::open(abs_path) else {
        return false;
    };
    let mut sample = Vec::with_capacity(SNIFF_LEN);
    if file.take(SNIFF_LEN as u64).read_to_end(&mut sample).is_err() {
        return false;
    }
    is_binary_content(&sample)
}
