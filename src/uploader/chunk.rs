//! 分片规划
//!
//! 分片数量由后端决定（返回多少个预签名地址就切多少片），
//! 本模块只负责把文件字节均匀映射到这些分片上。
//! 这里只产出字节范围描述，不做任何文件 IO，读取在存储层按范围流式进行

use crate::api::UploadError;

/// 单个分片的字节范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    /// 分片编号（从 1 开始，与预签名地址一一对应）
    pub part_number: u32,
    /// 起始偏移
    pub start: u64,
    /// 字节数
    pub length: u64,
}

impl PartRange {
    /// 结束偏移（不含）
    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

/// 将文件均匀划分为指定数量的连续分片
///
/// 前 N-1 片等长（file_size / part_count 向下取整），最后一片吸收余数。
/// 产出的范围互不重叠、首尾相接、长度之和恰为 file_size。
/// 文件小于分片数时会出现零长度分片，这只在后端对空文件或微小文件
/// 返回分片意图时发生
pub fn plan_parts(file_size: u64, part_count: u32) -> Result<Vec<PartRange>, UploadError> {
    if part_count == 0 {
        return Err(UploadError::Decode(
            "分片数量为 0，无法规划字节范围".to_string(),
        ));
    }

    let base_length = file_size / part_count as u64;
    let mut parts = Vec::with_capacity(part_count as usize);
    let mut offset = 0u64;

    for part_number in 1..=part_count {
        let length = if part_number == part_count {
            // 最后一片吸收余数
            file_size - offset
        } else {
            base_length
        };
        parts.push(PartRange {
            part_number,
            start: offset,
            length,
        });
        offset += length;
    }

    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 校验范围连续、编号连续、总长正确
    fn assert_plan_invariants(parts: &[PartRange], file_size: u64, part_count: u32) {
        assert_eq!(parts.len(), part_count as usize);
        let mut expected_start = 0u64;
        for (index, part) in parts.iter().enumerate() {
            assert_eq!(part.part_number, index as u32 + 1);
            assert_eq!(part.start, expected_start);
            expected_start = part.end();
        }
        assert_eq!(expected_start, file_size);
    }

    #[test]
    fn test_exact_division() {
        let parts = plan_parts(100, 4).expect("规划不应失败");
        assert_plan_invariants(&parts, 100, 4);
        assert!(parts.iter().all(|p| p.length == 25));
    }

    #[test]
    fn test_last_part_absorbs_remainder() {
        let parts = plan_parts(103, 4).expect("规划不应失败");
        assert_plan_invariants(&parts, 103, 4);
        assert_eq!(parts[0].length, 25);
        assert_eq!(parts[1].length, 25);
        assert_eq!(parts[2].length, 25);
        // 103 = 25 * 3 + 28
        assert_eq!(parts[3].length, 28);
    }

    #[test]
    fn test_single_part() {
        let parts = plan_parts(1024, 1).expect("规划不应失败");
        assert_plan_invariants(&parts, 1024, 1);
        assert_eq!(parts[0].start, 0);
        assert_eq!(parts[0].length, 1024);
    }

    #[test]
    fn test_fifty_megabytes_five_parts() {
        let size = 50 * 1024 * 1024;
        let parts = plan_parts(size, 5).expect("规划不应失败");
        assert_plan_invariants(&parts, size, 5);
        assert!(parts.iter().all(|p| p.length == 10 * 1024 * 1024));
    }

    #[test]
    fn test_more_parts_than_bytes() {
        // 3 字节切 5 片：前 4 片为零长度，最后一片拿到全部字节
        let parts = plan_parts(3, 5).expect("规划不应失败");
        assert_plan_invariants(&parts, 3, 5);
        assert_eq!(parts[4].length, 3);
    }

    #[test]
    fn test_zero_parts_rejected() {
        let result = plan_parts(1024, 0);
        assert!(matches!(result, Err(UploadError::Decode(_))));
    }

    #[test]
    fn test_large_file_does_not_overflow() {
        // 512 GB 文件切 10000 片
        let size = 512u64 * 1024 * 1024 * 1024;
        let parts = plan_parts(size, 10_000).expect("规划不应失败");
        assert_plan_invariants(&parts, size, 10_000);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// 任意文件大小与分片数下，范围连续、不重叠、数量精确、总和等于文件大小
            #[test]
            fn plan_covers_file_exactly(
                file_size in 1u64..=(1u64 << 40),
                part_count in 1u32..=4096,
            ) {
                let parts = plan_parts(file_size, part_count).expect("规划不应失败");
                prop_assert_eq!(parts.len(), part_count as usize);

                let mut expected_start = 0u64;
                let mut total = 0u64;
                for (index, part) in parts.iter().enumerate() {
                    prop_assert_eq!(part.part_number, index as u32 + 1);
                    prop_assert_eq!(part.start, expected_start);
                    expected_start = part.end();
                    total += part.length;
                }
                prop_assert_eq!(total, file_size);
            }

            /// 除最后一片外全部等长，最后一片不短于等分长度
            #[test]
            fn body_parts_are_uniform(
                file_size in 1u64..=(1u64 << 32),
                part_count in 2u32..=512,
            ) {
                let parts = plan_parts(file_size, part_count).expect("规划不应失败");
                let base = file_size / part_count as u64;
                for part in &parts[..parts.len() - 1] {
                    prop_assert_eq!(part.length, base);
                }
                prop_assert!(parts[parts.len() - 1].length >= base);
            }
        }
    }
}
