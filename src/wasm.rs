//! Browser bindings.
//!
//! Exposes the two entry points to JavaScript. Progress goes to an optional
//! JS callback; log records go to the browser console once `initLogging`
//! has been called.

use js_sys::Function;
use log::{Level, LevelFilter, Log, Metadata, Record};
use wasm_bindgen::prelude::*;

use crate::{CompressionResult, ProgressSink};

#[wasm_bindgen]
pub struct WasmCompressionResult {
    inner: CompressionResult,
}

#[wasm_bindgen]
impl WasmCompressionResult {
    /// Copies the output bytes into a new `Uint8Array`.
    #[wasm_bindgen(getter)]
    pub fn data(&self) -> Vec<u8> {
        self.inner.data.clone()
    }

    #[wasm_bindgen(getter, js_name = originalSize)]
    pub fn original_size(&self) -> usize {
        self.inner.original_size
    }

    #[wasm_bindgen(getter, js_name = compressedSize)]
    pub fn compressed_size(&self) -> usize {
        self.inner.compressed_size
    }

    #[wasm_bindgen(getter, js_name = compressionRatio)]
    pub fn compression_ratio(&self) -> f64 {
        self.inner.compression_ratio
    }

    /// MIME type of the output image, empty for PDFs.
    #[wasm_bindgen(getter)]
    pub fn format(&self) -> String {
        self.inner
            .format
            .map(|f| f.mime_type().to_string())
            .unwrap_or_default()
    }

    #[wasm_bindgen(getter, js_name = pageCount)]
    pub fn page_count(&self) -> usize {
        self.inner.pdf.map_or(0, |stats| stats.page_count)
    }

    #[wasm_bindgen(getter, js_name = processedPages)]
    pub fn processed_pages(&self) -> usize {
        self.inner.pdf.map_or(0, |stats| stats.processed_pages)
    }

    /// Name of the accepted PDF strategy, empty if none.
    #[wasm_bindgen(getter)]
    pub fn strategy(&self) -> String {
        self.inner
            .pdf
            .and_then(|stats| stats.strategy)
            .map(|kind| kind.to_string())
            .unwrap_or_default()
    }
}

struct JsProgress(Option<Function>);

impl ProgressSink for JsProgress {
    fn report(&mut self, value: u8) {
        if let Some(callback) = &self.0 {
            // A throwing callback must not abort compression.
            let _ = callback.call1(&JsValue::NULL, &JsValue::from(value));
        }
    }
}

fn to_js_error(e: crate::CompressError) -> JsValue {
    JsValue::from_str(&e.to_string())
}

#[wasm_bindgen(js_name = compressPdf)]
pub fn compress_pdf(data: &[u8], progress: Option<Function>) -> Result<WasmCompressionResult, JsValue> {
    let mut sink = JsProgress(progress);
    crate::compress_pdf(data, &mut sink)
        .map(|inner| WasmCompressionResult { inner })
        .map_err(to_js_error)
}

#[wasm_bindgen(js_name = compressImage)]
pub fn compress_image(
    data: &[u8],
    mime_type: &str,
    progress: Option<Function>,
) -> Result<WasmCompressionResult, JsValue> {
    let mut sink = JsProgress(progress);
    crate::compress_image(data, mime_type, &mut sink)
        .map(|inner| WasmCompressionResult { inner })
        .map_err(to_js_error)
}

struct ConsoleLogger;

static CONSOLE_LOGGER: ConsoleLogger = ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = JsValue::from_str(&format!("[{}] {}", record.target(), record.args()));
        match record.level() {
            Level::Error => web_sys::console::error_1(&line),
            Level::Warn => web_sys::console::warn_1(&line),
            _ => web_sys::console::log_1(&line),
        }
    }

    fn flush(&self) {}
}

/// Routes log records to the browser console. `verbose` lowers the level
/// from info to debug. Calling it twice is harmless.
#[wasm_bindgen(js_name = initLogging)]
pub fn init_logging(verbose: bool) {
    let _ = log::set_logger(&CONSOLE_LOGGER);
    log::set_max_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
}
