//! Collaborator seams and the operations built on them.

use std::sync::Arc;

use futures_util::{future::BoxFuture, stream::BoxStream, FutureExt, StreamExt};
use taskseeker_core::CapturedImage;
use taskseeker_platform::{process::PidSlot, ClipboardSelection, TesseractOcr};
use taskseeker_providers::ChatClient;
use tokio_util::sync::CancellationToken;

use crate::job::{JobContext, JobError, JobInput, Operation};

/// Synchronous text extraction. Called on a blocking thread; implementations
/// should poll `token` and publish child pids in `pid`.
pub trait TextRecognizer: Send + Sync {
    fn recognize(
        &self,
        job_id: &str,
        img: &CapturedImage,
        token: &CancellationToken,
        pid: &PidSlot,
    ) -> Result<String, JobError>;
}

impl TextRecognizer for TesseractOcr {
    fn recognize(
        &self,
        job_id: &str,
        img: &CapturedImage,
        token: &CancellationToken,
        pid: &PidSlot,
    ) -> Result<String, JobError> {
        TesseractOcr::recognize(self, job_id, img, token, pid).map_err(JobError::from)
    }
}

pub trait QueryClient: Send + Sync {
    fn complete(
        &self,
        job_id: String,
        prompt: String,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<String, JobError>>;

    fn stream(
        &self,
        job_id: String,
        prompt: String,
        token: CancellationToken,
    ) -> BoxStream<'static, Result<String, JobError>>;
}

impl QueryClient for ChatClient {
    fn complete(
        &self,
        job_id: String,
        prompt: String,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<String, JobError>> {
        let client = self.clone();
        async move {
            ChatClient::complete(&client, Some(&job_id), &prompt, &token)
                .await
                .map_err(JobError::from)
        }
        .boxed()
    }

    fn stream(
        &self,
        job_id: String,
        prompt: String,
        token: CancellationToken,
    ) -> BoxStream<'static, Result<String, JobError>> {
        ChatClient::stream(self, job_id, prompt, token)
            .map(|r| r.map_err(JobError::from))
            .boxed()
    }
}

/// Where `Dispatcher::on_selection_hotkey` gets the selected text from.
pub trait SelectionSource: Send + Sync {
    fn read_selection(&self) -> Result<Option<String>, JobError>;
}

impl SelectionSource for ClipboardSelection {
    fn read_selection(&self) -> Result<Option<String>, JobError> {
        ClipboardSelection::read_selection(self).map_err(JobError::from)
    }
}

fn expect_text(input: JobInput) -> Result<String, JobError> {
    match input {
        JobInput::Text(t) => Ok(t),
        JobInput::Image(_) => Err(JobError::new("E_INTERNAL", "query job got an image input")),
    }
}

/// OCR as a single-shot job. The recognizer runs under `spawn_blocking` so the
/// context's runtime stays free to observe the kill token. The blocking closure
/// owns the context, lease included, so the slot stays busy until it returns.
pub fn ocr_operation(recognizer: Arc<dyn TextRecognizer>) -> Operation {
    Operation::single_shot(move |input, ctx: JobContext| {
        let recognizer = recognizer.clone();
        async move {
            let img = match input {
                JobInput::Image(img) => img,
                JobInput::Text(_) => {
                    return Err(JobError::new("E_INTERNAL", "ocr job got a text input"))
                }
            };
            // Always awaited: the recognizer reports cancellation itself.
            let handle = tokio::task::spawn_blocking(move || {
                recognizer.recognize(&ctx.job_id, &img, &ctx.token, &ctx.pid)
            });
            match handle.await {
                Ok(r) => r,
                Err(e) if e.is_panic() => Err(JobError::new(
                    "E_PANIC",
                    format!("text recognizer panicked: {e}"),
                )),
                Err(_) => Err(JobError::cancelled()),
            }
        }
    })
}

/// Streaming query job: every delta is one fragment.
pub fn streaming_query_operation(client: Arc<dyn QueryClient>) -> Operation {
    Operation::streaming(move |input, ctx: JobContext| match expect_text(input) {
        Ok(prompt) => client.stream(ctx.job_id, prompt, ctx.token),
        Err(e) => futures_util::stream::once(async move { Err(e) }).boxed(),
    })
}

/// Non-streaming query job: the whole answer arrives as one fragment.
pub fn single_shot_query_operation(client: Arc<dyn QueryClient>) -> Operation {
    Operation::single_shot(move |input, ctx: JobContext| match expect_text(input) {
        Ok(prompt) => client.complete(ctx.job_id, prompt, ctx.token),
        Err(e) => async move { Err(e) }.boxed(),
    })
}

pub fn query_operation(client: Arc<dyn QueryClient>, stream_responses: bool) -> Operation {
    if stream_responses {
        streaming_query_operation(client)
    } else {
        single_shot_query_operation(client)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        sync::{atomic::AtomicUsize, mpsc},
    };

    use futures_util::stream;
    use taskseeker_platform::process::new_pid_slot;

    use super::*;
    use crate::job::{JobLease, SlotName};

    struct FixedText(&'static str);

    impl TextRecognizer for FixedText {
        fn recognize(
            &self,
            _job_id: &str,
            _img: &CapturedImage,
            _token: &CancellationToken,
            _pid: &PidSlot,
        ) -> Result<String, JobError> {
            Ok(self.0.to_string())
        }
    }

    struct Exploding;

    impl TextRecognizer for Exploding {
        fn recognize(
            &self,
            _job_id: &str,
            _img: &CapturedImage,
            _token: &CancellationToken,
            _pid: &PidSlot,
        ) -> Result<String, JobError> {
            panic!("tesseract wrapper blew up");
        }
    }

    struct Echo;

    impl QueryClient for Echo {
        fn complete(
            &self,
            _job_id: String,
            prompt: String,
            _token: CancellationToken,
        ) -> BoxFuture<'static, Result<String, JobError>> {
            async move { Ok(format!("answer to {prompt}")) }.boxed()
        }

        fn stream(
            &self,
            _job_id: String,
            prompt: String,
            _token: CancellationToken,
        ) -> BoxStream<'static, Result<String, JobError>> {
            stream::iter(vec![Ok("answer ".to_string()), Ok(format!("to {prompt}"))]).boxed()
        }
    }

    fn ctx(slot: SlotName) -> JobContext {
        JobContext {
            job_id: "job-1".to_string(),
            slot,
            token: CancellationToken::new(),
            pid: new_pid_slot(),
            data_dir: PathBuf::from("."),
            lease: JobLease::new(Arc::new(AtomicUsize::new(0)), mpsc::channel().0),
        }
    }

    fn image() -> JobInput {
        JobInput::Image(CapturedImage::new(1, 1, vec![255; 4]).expect("image"))
    }

    async fn run_single(op: &Operation, input: JobInput, slot: SlotName) -> Result<String, JobError> {
        match op {
            Operation::SingleShot(f) => f(input, ctx(slot)).await,
            Operation::Streaming(_) => panic!("expected a single-shot operation"),
        }
    }

    #[tokio::test]
    async fn ocr_operation_returns_recognized_text() {
        let op = ocr_operation(Arc::new(FixedText("hello")));
        let out = run_single(&op, image(), SlotName::Ocr).await;
        assert_eq!(out, Ok("hello".to_string()));
    }

    #[tokio::test]
    async fn ocr_operation_rejects_text_input() {
        let op = ocr_operation(Arc::new(FixedText("unused")));
        let err = run_single(&op, JobInput::Text("x".into()), SlotName::Ocr)
            .await
            .expect_err("text input");
        assert_eq!(err.code, "E_INTERNAL");
    }

    #[tokio::test]
    async fn recognizer_panic_becomes_an_error() {
        let op = ocr_operation(Arc::new(Exploding));
        let err = run_single(&op, image(), SlotName::Ocr)
            .await
            .expect_err("panic");
        assert_eq!(err.code, "E_PANIC");
    }

    #[tokio::test]
    async fn streaming_query_yields_each_delta() {
        let op = query_operation(Arc::new(Echo), true);
        let Operation::Streaming(f) = &op else {
            panic!("expected streaming, got {op:?}");
        };
        let parts: Vec<_> = f(JobInput::Text("why".into()), ctx(SlotName::Query))
            .collect()
            .await;
        assert_eq!(
            parts,
            vec![Ok("answer ".to_string()), Ok("to why".to_string())]
        );
    }

    #[tokio::test]
    async fn non_streaming_query_returns_whole_answer() {
        let op = query_operation(Arc::new(Echo), false);
        let out = run_single(&op, JobInput::Text("why".into()), SlotName::Query).await;
        assert_eq!(out, Ok("answer to why".to_string()));
    }
}
