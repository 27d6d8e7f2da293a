//! End-to-end exercises of [`dictation_grading_core::grading::grade`]
//! against mocked VLM/OCR endpoints, covering the boundary scenarios.

use std::sync::Arc;

use dictation_grading_core::grading::config::GradingConfig;
use dictation_grading_core::grading::delegate::InMemoryDelegate;
use dictation_grading_core::grading::types::MatchMethod;
use dictation_grading_core::grading::{grade, PageUpload};

fn solid_jpeg() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(200, 300, image::Rgb([255, 255, 255]));
    let mut bytes = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut bytes);
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut cursor, image::ImageOutputFormat::Jpeg(90))
        .unwrap();
    bytes
}

fn vlm_reply_body(content: &str) -> serde_json::Value {
    serde_json::json!({
        "choices": [{ "message": { "content": content } }]
    })
}

#[tokio::test]
async fn simple_words_scenario_produces_three_consistent_items() {
    let mut server = mockito::Server::new_async().await;

    let vlm_content = serde_json::json!({
        "sections": [{
            "title": "Words", "type": "WORD",
            "items": [
                {"q":1,"hint":"苹果","ans":"apple","ok":true,"conf":0.98,"pg":0},
                {"q":2,"hint":"尾巴","ans":"teil","ok":false,"conf":0.95,"pg":0},
                {"q":3,"hint":"马","ans":"","ok":false,"conf":1.0,"pg":0,"note":"未作答"}
            ]
        }]
    })
    .to_string();

    let vlm_mock = server
        .mock("POST", "/vlm")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(vlm_reply_body(&vlm_content).to_string())
        .create_async()
        .await;

    let ocr_body = serde_json::json!({
        "words": [
            {"text": "apple", "bbox": [160.0,440.0,240.0,510.0], "type": "handwritten", "confidence": 0.92},
            {"text": "teil", "bbox": [160.0,520.0,240.0,590.0], "type": "handwritten", "confidence": 0.88}
        ]
    });
    let ocr_mock = server
        .mock("POST", "/ocr")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(ocr_body.to_string())
        .create_async()
        .await;

    let mut config = GradingConfig::default();
    config.llm.endpoint = format!("{}/vlm", server.url());
    config.llm.model = "test-model".into();
    config.ocr.endpoint = format!("{}/ocr", server.url());

    let delegate = Arc::new(InMemoryDelegate::new());
    let uploads = vec![PageUpload { bytes: solid_jpeg(), mime_hint: None }];

    let result = grade(uploads, &config, delegate, None).await.unwrap();

    assert_eq!(result.items.len(), 3);
    assert_eq!(result.items[0].position, 1);
    assert_eq!(result.items[1].position, 2);
    assert_eq!(result.items[2].position, 3);

    assert_eq!(result.items[0].ocr_text, "apple");
    assert!(result.items[0].is_correct);
    assert!(matches!(result.items[0].match_method, MatchMethod::TextSimilarity(r) if r > 0.99));
    assert_eq!(result.items[0].consistency_ok, Some(true));

    assert_eq!(result.items[1].ocr_text, "teil");
    assert!(!result.items[1].is_correct);

    assert_eq!(result.items[2].ocr_text, "");
    assert_eq!(result.items[2].match_method, MatchMethod::EmptyAnswer);
    assert_eq!(result.items[2].consistency_ok, None);

    assert!(result.worksheet_uuid.is_none());
    assert_eq!(result.graded_image_urls.len(), 1);
    assert!(result.graded_image_urls[0].is_some());

    vlm_mock.assert_async().await;
    ocr_mock.assert_async().await;
}

#[tokio::test]
async fn ocr_failure_degrades_to_vlm_only_survival() {
    let mut server = mockito::Server::new_async().await;

    let vlm_content = serde_json::json!({
        "items": [
            {"q":1,"hint":"苹果","ans":"apple","ok":true,"conf":0.98,"pg":0}
        ]
    })
    .to_string();

    let vlm_mock = server
        .mock("POST", "/vlm")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(vlm_reply_body(&vlm_content).to_string())
        .create_async()
        .await;

    let ocr_mock = server
        .mock("POST", "/ocr")
        .with_status(500)
        .with_body("internal error")
        .expect_at_least(1)
        .create_async()
        .await;

    let mut config = GradingConfig::default();
    config.llm.endpoint = format!("{}/vlm", server.url());
    config.llm.model = "test-model".into();
    config.ocr.endpoint = format!("{}/ocr", server.url());
    config.ocr_retry_attempts = 1;

    let delegate = Arc::new(InMemoryDelegate::new());
    let uploads = vec![PageUpload { bytes: solid_jpeg(), mime_hint: None }];

    let result = grade(uploads, &config, delegate, None).await.unwrap();

    assert_eq!(result.items.len(), 1);
    assert_eq!(result.items[0].ocr_text, "");
    assert_eq!(result.items[0].match_method, MatchMethod::None);
    assert_eq!(result.items[0].consistency_ok, None);
    assert_eq!(result.items[0].llm_text, "apple");
    assert!(result.worksheet_uuid.is_none());

    vlm_mock.assert_async().await;
    ocr_mock.assert_async().await;
}

#[tokio::test]
async fn rejects_an_undecodable_page_without_calling_either_engine() {
    let mut server = mockito::Server::new_async().await;
    let vlm_mock = server.mock("POST", "/vlm").expect(0).create_async().await;
    let ocr_mock = server.mock("POST", "/ocr").expect(0).create_async().await;

    let mut config = GradingConfig::default();
    config.llm.endpoint = format!("{}/vlm", server.url());
    config.ocr.endpoint = format!("{}/ocr", server.url());

    let delegate = Arc::new(InMemoryDelegate::new());
    let uploads = vec![PageUpload { bytes: vec![0, 1, 2, 3], mime_hint: None }];

    let err = grade(uploads, &config, delegate, None).await.unwrap_err();
    assert!(matches!(
        err,
        dictation_grading_core::grading::error::GradingError::InvalidImage(_)
    ));

    vlm_mock.assert_async().await;
    ocr_mock.assert_async().await;
}
