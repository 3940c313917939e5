//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use parking_lot::Mutex;

use crate::codec::ImagePayload;
use crate::compose::ModelRequest;
use crate::error::{GenerationError, Result};
use crate::gemini::{GenerativeModel, ResponsePart};

pub fn png(width: u32, height: u32, rgb: [u8; 3]) -> ImagePayload {
    encoded(width, height, rgb, ImageFormat::Png)
}

/// Solid-color image in any format the crate can decode.
pub fn encoded(width: u32, height: u32, rgb: [u8; 3], format: ImageFormat) -> ImagePayload {
    let mut img = DynamicImage::from(RgbaImage::from_pixel(width, height, Rgba([rgb[0], rgb[1], rgb[2], 255])));
    if format == ImageFormat::Jpeg {
        img = DynamicImage::from(img.to_rgb8());
    }
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, format).expect("encode test image");
    ImagePayload::new(format.to_mime_type(), buf.into_inner())
}

struct Reply {
    delay: Duration,
    outcome: Result<Vec<ResponsePart>>,
}

/// Replays queued replies in order and records every request it sees.
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, delay: Duration, outcome: Result<Vec<ResponsePart>>) -> &Self {
        self.replies.lock().push_back(Reply { delay, outcome });
        self
    }

    pub fn push_image(&self, image: ImagePayload) -> &Self {
        self.push(Duration::ZERO, Ok(vec![ResponsePart::Image(image)]))
    }

    /// An image reply that only arrives after `delay`.
    pub fn push_slow_image(&self, image: ImagePayload, delay: Duration) -> &Self {
        self.push(delay, Ok(vec![ResponsePart::Image(image)]))
    }

    pub fn push_text(&self, text: &str) -> &Self {
        self.push(Duration::ZERO, Ok(vec![ResponsePart::Text(text.to_string())]))
    }

    pub fn push_error(&self, err: GenerationError) -> &Self {
        self.push(Duration::ZERO, Err(err))
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl GenerativeModel for ScriptedModel {
    async fn generate(&self, request: &ModelRequest) -> Result<Vec<ResponsePart>> {
        self.requests.lock().push(request.clone());
        let reply = self.replies.lock().pop_front();
        let Some(Reply { delay, outcome }) = reply else {
            return Err(GenerationError::Upstream { status: Some(500), message: "no scripted reply".into() });
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        outcome
    }
}
