//! 后端接口数据类型
//!
//! 原始响应结构仅用于反序列化，随后转换为 `UploadIntent` 和类型化错误，
//! 上传方式以响应形态为准（单片/分片二选一）

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::error::UploadError;

/// 期望的上传方式（仅作为提示发送，后端有最终决定权）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    /// 单次表单上传
    Single,
    /// 分片上传
    Multipart,
}

/// POST /v1/assets 请求体
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAssetRequest {
    /// 目标图库 ID
    pub gallery_id: String,
    /// 图库内分区（可选）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    /// 资产展示名称
    pub name: String,
    /// 文件字节数
    pub content_length: u64,
    /// 期望的上传方式提示
    pub desired_mode: UploadMode,
}

/// 单个分片的预签名上传地址
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartUrl {
    /// 分片编号（从 1 开始）
    pub part_number: u32,
    /// 预签名 URL
    pub url: String,
}

/// POST /v1/assets 原始响应
///
/// 单片与分片两种形态共用该结构，可选字段在 `UploadIntent` 转换时校验
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAssetResponse {
    /// 后端创建的资产 ID
    pub asset_id: String,
    /// 对象存储键
    pub storage_key: String,
    /// 单片模式：表单上传目标地址
    #[serde(default)]
    pub upload_url: Option<String>,
    /// 单片模式：随表单提交的字段
    #[serde(default)]
    pub form_fields: Option<HashMap<String, String>>,
    /// 分片模式：多段上传 ID
    #[serde(default)]
    pub upload_id: Option<String>,
    /// 分片模式：每个分片的预签名地址
    #[serde(default)]
    pub upload_urls: Option<Vec<PartUrl>>,
}

/// 上传意图：后端指定的上传方式与目的地
///
/// 显式和类型，分支处穷尽匹配，不允许以可空字段的组合表达两种形态
#[derive(Debug, Clone)]
pub enum UploadIntent {
    /// 单次表单上传：POST 表单字段 + 文件体到目标地址即完成
    SinglePart {
        asset_id: String,
        storage_key: String,
        target_url: String,
        form_fields: HashMap<String, String>,
    },
    /// 分片上传：逐片 PUT 到预签名地址，最后调用合并接口
    MultiPart {
        asset_id: String,
        storage_key: String,
        upload_id: String,
        part_urls: Vec<PartUrl>,
    },
}

impl UploadIntent {
    pub fn asset_id(&self) -> &str {
        match self {
            UploadIntent::SinglePart { asset_id, .. } => asset_id,
            UploadIntent::MultiPart { asset_id, .. } => asset_id,
        }
    }

    /// 分片数量（单片意图为 0）
    pub fn part_count(&self) -> usize {
        match self {
            UploadIntent::SinglePart { .. } => 0,
            UploadIntent::MultiPart { part_urls, .. } => part_urls.len(),
        }
    }
}

impl TryFrom<CreateAssetResponse> for UploadIntent {
    type Error = UploadError;

    /// 校验响应形态并转换
    ///
    /// 拒绝两种形态字段同时出现或都缺失的响应；
    /// 分片编号必须从 1 开始连续递增，与字节范围一一对应
    fn try_from(raw: CreateAssetResponse) -> Result<Self, UploadError> {
        match (raw.upload_url, raw.upload_id) {
            (Some(target_url), None) => Ok(UploadIntent::SinglePart {
                asset_id: raw.asset_id,
                storage_key: raw.storage_key,
                target_url,
                form_fields: raw.form_fields.unwrap_or_default(),
            }),
            (None, Some(upload_id)) => {
                let part_urls = raw.upload_urls.unwrap_or_default();
                if part_urls.is_empty() {
                    return Err(UploadError::Decode(
                        "分片响应未包含任何预签名地址".to_string(),
                    ));
                }
                for (index, part) in part_urls.iter().enumerate() {
                    let expected = index as u32 + 1;
                    if part.part_number != expected {
                        return Err(UploadError::Decode(format!(
                            "分片编号不连续: 第 {} 项编号为 {}，应为 {}",
                            index, part.part_number, expected
                        )));
                    }
                }
                Ok(UploadIntent::MultiPart {
                    asset_id: raw.asset_id,
                    storage_key: raw.storage_key,
                    upload_id,
                    part_urls,
                })
            }
            (Some(_), Some(_)) => Err(UploadError::Decode(
                "响应同时包含单片和分片字段，无法判定上传方式".to_string(),
            )),
            (None, None) => Err(UploadError::Decode(
                "响应缺少上传方式字段（uploadUrl 或 uploadId）".to_string(),
            )),
        }
    }
}

/// 合并请求中的单个分片
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    /// 存储端返回的内容标识（ETag 等）
    pub content_identifier: String,
}

/// POST /v1/assets/{id}/complete-multipart 请求体
///
/// parts 必须按分片编号升序排列
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteMultipartRequest {
    /// 对象存储键
    pub key: String,
    /// 多段上传 ID
    pub upload_id: String,
    /// 全部分片的确认信息
    pub parts: Vec<CompletedPart>,
}

/// 后端错误响应体（尽力解析，缺失时回退为原始文本）
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_intent(json: &str) -> Result<UploadIntent, UploadError> {
        let raw: CreateAssetResponse = serde_json::from_str(json).expect("测试 JSON 应可解析");
        UploadIntent::try_from(raw)
    }

    #[test]
    fn test_decode_single_part() {
        let intent = decode_intent(
            r#"{
                "assetId": "a-1",
                "storageKey": "galleries/g1/a-1.jpg",
                "uploadUrl": "https://storage.test/upload",
                "formFields": {"key": "galleries/g1/a-1.jpg", "policy": "xxx"}
            }"#,
        )
        .expect("单片响应应可转换");

        match intent {
            UploadIntent::SinglePart {
                asset_id,
                target_url,
                form_fields,
                ..
            } => {
                assert_eq!(asset_id, "a-1");
                assert_eq!(target_url, "https://storage.test/upload");
                assert_eq!(form_fields.len(), 2);
            }
            UploadIntent::MultiPart { .. } => panic!("应判定为单片形态"),
        }
    }

    #[test]
    fn test_decode_multi_part() {
        let intent = decode_intent(
            r#"{
                "assetId": "a-2",
                "storageKey": "galleries/g1/a-2.raw",
                "uploadId": "mp-123",
                "uploadUrls": [
                    {"partNumber": 1, "url": "https://storage.test/p1"},
                    {"partNumber": 2, "url": "https://storage.test/p2"},
                    {"partNumber": 3, "url": "https://storage.test/p3"}
                ]
            }"#,
        )
        .expect("分片响应应可转换");

        match intent {
            UploadIntent::MultiPart {
                upload_id,
                part_urls,
                ..
            } => {
                assert_eq!(upload_id, "mp-123");
                assert_eq!(part_urls.len(), 3);
                assert_eq!(part_urls[2].part_number, 3);
            }
            UploadIntent::SinglePart { .. } => panic!("应判定为分片形态"),
        }
    }

    #[test]
    fn test_decode_rejects_ambiguous_response() {
        let result = decode_intent(
            r#"{
                "assetId": "a-3",
                "storageKey": "k",
                "uploadUrl": "https://storage.test/upload",
                "uploadId": "mp-9"
            }"#,
        );
        assert!(matches!(result, Err(UploadError::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_missing_mode() {
        let result = decode_intent(r#"{"assetId": "a-4", "storageKey": "k"}"#);
        assert!(matches!(result, Err(UploadError::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_noncontiguous_parts() {
        // 编号从 2 开始
        let result = decode_intent(
            r#"{
                "assetId": "a-5",
                "storageKey": "k",
                "uploadId": "mp-1",
                "uploadUrls": [
                    {"partNumber": 2, "url": "https://storage.test/p2"},
                    {"partNumber": 3, "url": "https://storage.test/p3"}
                ]
            }"#,
        );
        assert!(matches!(result, Err(UploadError::Decode(_))));

        // 编号跳跃
        let result = decode_intent(
            r#"{
                "assetId": "a-6",
                "storageKey": "k",
                "uploadId": "mp-2",
                "uploadUrls": [
                    {"partNumber": 1, "url": "https://storage.test/p1"},
                    {"partNumber": 3, "url": "https://storage.test/p3"}
                ]
            }"#,
        );
        assert!(matches!(result, Err(UploadError::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_empty_part_list() {
        let result = decode_intent(
            r#"{"assetId": "a-7", "storageKey": "k", "uploadId": "mp-3", "uploadUrls": []}"#,
        );
        assert!(matches!(result, Err(UploadError::Decode(_))));
    }

    #[test]
    fn test_create_asset_request_wire_format() {
        let request = CreateAssetRequest {
            gallery_id: "g-1".to_string(),
            section: None,
            name: "IMG_0001.jpg".to_string(),
            content_length: 2_097_152,
            desired_mode: UploadMode::Single,
        };
        let json = serde_json::to_value(&request).expect("序列化不应失败");
        assert_eq!(json["galleryId"], "g-1");
        assert_eq!(json["contentLength"], 2_097_152);
        assert_eq!(json["desiredMode"], "single");
        // 未设置的分区字段不应出现在请求体里
        assert!(json.get("section").is_none());
    }

    #[test]
    fn test_complete_request_wire_format() {
        let request = CompleteMultipartRequest {
            key: "galleries/g1/a-2.raw".to_string(),
            upload_id: "mp-123".to_string(),
            parts: vec![
                CompletedPart {
                    part_number: 1,
                    content_identifier: "etag-1".to_string(),
                },
                CompletedPart {
                    part_number: 2,
                    content_identifier: "etag-2".to_string(),
                },
            ],
        };
        let json = serde_json::to_value(&request).expect("序列化不应失败");
        assert_eq!(json["uploadId"], "mp-123");
        assert_eq!(json["parts"][0]["partNumber"], 1);
        assert_eq!(json["parts"][1]["contentIdentifier"], "etag-2");
    }
}
