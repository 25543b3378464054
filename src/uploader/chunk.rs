// 上传分片规划
//
// 分片大小按文件大小分档：
// - 文件 < 100MB：5MB 分片
// - 文件 < 500MB：10MB 分片
// - 文件 < 2GB：25MB 分片
// - 其余：50MB 分片
//
// 分片序号从 1 开始，最后一个分片承担余数。

use crate::uploader::error::{UploadError, UploadResult};
use std::ops::Range;
use std::path::Path;
use tracing::debug;

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

/// 小文件分片大小: 5MB（对象存储分片下限）
pub const SMALL_PART_SIZE: u64 = 5 * MB;

/// 中等文件分片大小: 10MB
pub const MEDIUM_PART_SIZE: u64 = 10 * MB;

/// 大文件分片大小: 25MB
pub const LARGE_PART_SIZE: u64 = 25 * MB;

/// 超大文件分片大小: 50MB
pub const HUGE_PART_SIZE: u64 = 50 * MB;

/// 分档阈值
pub const MEDIUM_FILE_THRESHOLD: u64 = 100 * MB;
pub const LARGE_FILE_THRESHOLD: u64 = 500 * MB;
pub const HUGE_FILE_THRESHOLD: u64 = 2 * GB;

/// 默认最小文件大小: 1KB
pub const DEFAULT_MIN_FILE_SIZE: u64 = 1024;

/// 默认最大文件大小: 5GB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 5 * GB;

/// 根据文件大小选择分片大小
pub fn select_part_size(file_size: u64) -> u64 {
    if file_size < MEDIUM_FILE_THRESHOLD {
        SMALL_PART_SIZE
    } else if file_size < LARGE_FILE_THRESHOLD {
        MEDIUM_PART_SIZE
    } else if file_size < HUGE_FILE_THRESHOLD {
        LARGE_PART_SIZE
    } else {
        HUGE_PART_SIZE
    }
}

/// 分片描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartDescriptor {
    /// 分片序号（1..=total_parts）
    pub part_number: u32,
    /// 起始字节（含）
    pub byte_start: u64,
    /// 结束字节（不含）
    pub byte_end: u64,
}

impl PartDescriptor {
    pub fn new(part_number: u32, range: Range<u64>) -> Self {
        Self {
            part_number,
            byte_start: range.start,
            byte_end: range.end,
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.byte_end - self.byte_start
    }

    /// 字节范围
    pub fn range(&self) -> Range<u64> {
        self.byte_start..self.byte_end
    }

    /// 在进度数组中的下标
    pub fn index(&self) -> usize {
        (self.part_number - 1) as usize
    }
}

/// 计算分片列表
///
/// # 参数
/// * `file_size` - 文件大小
/// * `part_size` - 分片大小
/// * `max_file_size` - 允许的最大文件大小
///
/// # 返回
/// 连续、不重叠、覆盖整个文件的分片列表
pub fn compute_part_descriptors(
    file_size: u64,
    part_size: u64,
    max_file_size: u64,
) -> UploadResult<Vec<PartDescriptor>> {
    if file_size == 0 {
        return Err(UploadError::Validation("文件大小必须大于 0".to_string()));
    }
    if file_size > max_file_size {
        return Err(UploadError::Validation(format!(
            "文件大小 {} 超过上限 {}",
            file_size, max_file_size
        )));
    }
    if part_size == 0 {
        return Err(UploadError::Validation("分片大小必须大于 0".to_string()));
    }

    let total_parts = file_size.div_ceil(part_size);
    let total_parts = u32::try_from(total_parts).map_err(|_| {
        UploadError::Validation(format!("分片数量 {} 超出范围", total_parts))
    })?;

    let parts: Vec<PartDescriptor> = (1..=total_parts)
        .map(|part_number| {
            let start = (part_number as u64 - 1) * part_size;
            let end = std::cmp::min(start + part_size, file_size);
            PartDescriptor::new(part_number, start..end)
        })
        .collect();

    debug!(
        "分片规划完成: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
        file_size, part_size, total_parts
    );

    Ok(parts)
}

/// 分片计划
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    pub file_size: u64,
    pub part_size: u64,
    pub parts: Vec<PartDescriptor>,
}

impl ChunkPlan {
    /// 按分档规则规划整个文件
    pub fn for_file(file_size: u64, max_file_size: u64) -> UploadResult<Self> {
        let part_size = select_part_size(file_size);
        let parts = compute_part_descriptors(file_size, part_size, max_file_size)?;
        Ok(Self {
            file_size,
            part_size,
            parts,
        })
    }

    pub fn total_parts(&self) -> u32 {
        self.parts.len() as u32
    }
}

// =====================================================
// 输入校验
// =====================================================

/// 上传输入限制
#[derive(Debug, Clone)]
pub struct UploadLimits {
    pub min_file_size: u64,
    pub max_file_size: u64,
    pub allowed_mime_types: Vec<String>,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            min_file_size: DEFAULT_MIN_FILE_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            allowed_mime_types: default_video_mime_types(),
        }
    }
}

/// 默认允许的视频容器类型
pub fn default_video_mime_types() -> Vec<String> {
    [
        "video/mp4",
        "video/quicktime",
        "video/webm",
        "video/x-matroska",
        "video/x-msvideo",
        "video/x-m4v",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// 在任何网络请求之前校验文件大小和类型
pub fn validate_upload_input(
    file_size: u64,
    mime_type: &str,
    limits: &UploadLimits,
) -> UploadResult<()> {
    if file_size < limits.min_file_size || file_size > limits.max_file_size {
        return Err(UploadError::Validation(format!(
            "文件大小 {} 不在允许范围 [{}, {}] 内",
            file_size, limits.min_file_size, limits.max_file_size
        )));
    }

    let mime = mime_type.trim().to_ascii_lowercase();
    if !limits.allowed_mime_types.iter().any(|m| *m == mime) {
        return Err(UploadError::Validation(format!(
            "不支持的文件类型: {}",
            mime_type
        )));
    }

    Ok(())
}

/// 根据扩展名推断视频 MIME 类型
pub fn guess_video_mime(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "mp4" => Some("video/mp4"),
        "mov" => Some("video/quicktime"),
        "webm" => Some("video/webm"),
        "mkv" => Some("video/x-matroska"),
        "avi" => Some("video/x-msvideo"),
        "m4v" => Some("video/x-m4v"),
        _ => None,
    }
}
