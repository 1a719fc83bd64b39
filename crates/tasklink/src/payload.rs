//! Type-erased task payload: request, codec, hooks and completer behind one
//! object the dispatcher can drive without knowing the response type.

use bytes::Bytes;

use crate::codec::{CodecError, TaskCodec, TaskHooks};
use crate::completion::{Completer, TaskError};
use crate::transport::{CompletionDisposition, ErrType};

pub(crate) trait ErasedTask: Send {
    fn encode(&mut self) -> Result<Bytes, CodecError>;

    fn finish(
        self: Box<Self>,
        err_type: ErrType,
        err_code: i32,
        body: &[u8],
    ) -> CompletionDisposition;

    fn fail(self: Box<Self>, error: TaskError);
}

pub(crate) struct CodecTask<C: TaskCodec, H> {
    codec: C,
    request: C::Request,
    hooks: H,
    completer: Completer<C::Response>,
}

impl<C: TaskCodec, H> CodecTask<C, H> {
    pub(crate) fn new(
        codec: C,
        request: C::Request,
        hooks: H,
        completer: Completer<C::Response>,
    ) -> Self {
        Self {
            codec,
            request,
            hooks,
            completer,
        }
    }

    fn deliver(&mut self, result: Result<C::Response, TaskError>) {
        // A payload is consumed by finish/fail, so this is the only delivery.
        let _ = self.completer.resolve(result);
    }
}

impl<C, H> ErasedTask for CodecTask<C, H>
where
    C: TaskCodec,
    H: TaskHooks<C::Request, C::Response>,
{
    fn encode(&mut self) -> Result<Bytes, CodecError> {
        self.hooks.before_encode(&mut self.request);
        self.codec.encode(&self.request)
    }

    fn finish(
        mut self: Box<Self>,
        err_type: ErrType,
        err_code: i32,
        body: &[u8],
    ) -> CompletionDisposition {
        if err_code != 0 {
            self.deliver(Err(TaskError::Failed { err_type, err_code }));
            return CompletionDisposition::Handled;
        }
        match self.codec.decode(body) {
            Ok(mut response) => {
                self.hooks.after_decode(&mut response);
                self.deliver(Ok(response));
                CompletionDisposition::Handled
            }
            Err(e) => {
                tracing::warn!(target: "tasklink::codec", error = %e, body_len = body.len(), "Failed to decode response");
                self.deliver(Err(TaskError::from(e)));
                CompletionDisposition::TaskEnd
            }
        }
    }

    fn fail(mut self: Box<Self>, error: TaskError) {
        self.deliver(Err(error));
    }
}
