//! Service registry for dispatching accepted streams by method name.
//!
//! Each method is registered with its call shape. The shape decides how the
//! stream is presented to the handler: a single decoded request, a
//! [`StreamReceiver`], a [`StreamSender`], or both.
//!
//! # Example
//!
//! ```ignore
//! use streamwire::handler::ServiceRegistry;
//!
//! let mut services = ServiceRegistry::new();
//! services
//!     .register_unary("/echo/Echo", |_ctx, req: Greeting| async move { Ok(req) })
//!     .register_server_streaming("/echo/Repeat", |_ctx, req: Greeting, mut out| async move {
//!         for _ in 0..req.count {
//!             out.send(&req).await?;
//!         }
//!         Ok(())
//!     });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use super::{CallContext, ServerCall};
use crate::call::{StreamReceiver, StreamSender};
use crate::codec::StreamMessage;
use crate::error::{Result, StreamwireError};
use crate::stream::CallShape;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased method handler.
///
/// The returned future owns the whole call: it reads requests, runs the
/// user function and reports the outcome through the call's
/// [`Completion`](super::Completion).
pub trait Handler: Send + Sync + 'static {
    fn call(&self, call: ServerCall) -> BoxFuture<'static, Result<()>>;
}

fn missing_request(ctx: &CallContext) -> StreamwireError {
    StreamwireError::Protocol {
        stream_id: ctx.stream_id(),
        reason: "client finished without sending a request".to_string(),
    }
}

/// `Fn(CallContext, Req) -> Resp`.
pub struct UnaryHandler<F, Req, Resp, Fut> {
    handler: Arc<F>,
    _phantom: PhantomData<fn(Req) -> (Resp, Fut)>,
}

impl<F, Req, Resp, Fut> Handler for UnaryHandler<F, Req, Resp, Fut>
where
    F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
    Req: StreamMessage,
    Resp: StreamMessage,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    fn call(&self, call: ServerCall) -> BoxFuture<'static, Result<()>> {
        let handler = self.handler.clone();
        Box::pin(async move {
            let (ctx, mut requests, mut responses, completion) = call.into_parts::<Req, Resp>();
            let result = async move {
                let request = requests
                    .recv()
                    .await?
                    .ok_or_else(|| missing_request(&ctx))?;
                let response = handler(ctx, request).await?;
                responses.send(&response).await
            }
            .await;
            completion.finish(result).await
        })
    }
}

/// `Fn(CallContext, StreamReceiver<Req>) -> Resp`.
pub struct ClientStreamingHandler<F, Req, Resp, Fut> {
    handler: Arc<F>,
    _phantom: PhantomData<fn(Req) -> (Resp, Fut)>,
}

impl<F, Req, Resp, Fut> Handler for ClientStreamingHandler<F, Req, Resp, Fut>
where
    F: Fn(CallContext, StreamReceiver<Req>) -> Fut + Send + Sync + 'static,
    Req: StreamMessage,
    Resp: StreamMessage,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    fn call(&self, call: ServerCall) -> BoxFuture<'static, Result<()>> {
        let handler = self.handler.clone();
        Box::pin(async move {
            let (ctx, requests, mut responses, completion) = call.into_parts::<Req, Resp>();
            let result = async move {
                let response = handler(ctx, requests).await?;
                responses.send(&response).await
            }
            .await;
            completion.finish(result).await
        })
    }
}

/// `Fn(CallContext, Req, StreamSender<Resp>)`.
pub struct ServerStreamingHandler<F, Req, Resp, Fut> {
    handler: Arc<F>,
    _phantom: PhantomData<fn(Req) -> (Resp, Fut)>,
}

impl<F, Req, Resp, Fut> Handler for ServerStreamingHandler<F, Req, Resp, Fut>
where
    F: Fn(CallContext, Req, StreamSender<Resp>) -> Fut + Send + Sync + 'static,
    Req: StreamMessage,
    Resp: StreamMessage,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, call: ServerCall) -> BoxFuture<'static, Result<()>> {
        let handler = self.handler.clone();
        Box::pin(async move {
            let (ctx, mut requests, responses, completion) = call.into_parts::<Req, Resp>();
            let result = async move {
                let request = requests
                    .recv()
                    .await?
                    .ok_or_else(|| missing_request(&ctx))?;
                handler(ctx, request, responses).await
            }
            .await;
            completion.finish(result).await
        })
    }
}

/// `Fn(CallContext, StreamReceiver<Req>, StreamSender<Resp>)`.
pub struct BidiHandler<F, Req, Resp, Fut> {
    handler: Arc<F>,
    _phantom: PhantomData<fn(Req) -> (Resp, Fut)>,
}

impl<F, Req, Resp, Fut> Handler for BidiHandler<F, Req, Resp, Fut>
where
    F: Fn(CallContext, StreamReceiver<Req>, StreamSender<Resp>) -> Fut + Send + Sync + 'static,
    Req: StreamMessage,
    Resp: StreamMessage,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, call: ServerCall) -> BoxFuture<'static, Result<()>> {
        let handler = self.handler.clone();
        Box::pin(async move {
            let (ctx, requests, responses, completion) = call.into_parts::<Req, Resp>();
            let result = handler(ctx, requests, responses).await;
            completion.finish(result).await
        })
    }
}

/// Entry for a registered method.
struct MethodEntry {
    handler: Box<dyn Handler>,
    shape: CallShape,
}

/// Registry mapping method names to handlers.
#[derive(Default)]
pub struct ServiceRegistry {
    methods: HashMap<String, MethodEntry>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, func: &str, shape: CallShape, handler: Box<dyn Handler>) -> &mut Self {
        if self
            .methods
            .insert(func.to_string(), MethodEntry { handler, shape })
            .is_some()
        {
            tracing::warn!(func, "handler replaced");
        }
        self
    }

    /// Register a method answering one request with one response.
    ///
    /// Returning [`StreamwireError::Rpc`] closes the call with that ret.
    pub fn register_unary<F, Req, Resp, Fut>(&mut self, func: &str, handler: F) -> &mut Self
    where
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Req: StreamMessage,
        Resp: StreamMessage,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        let handler = UnaryHandler {
            handler: Arc::new(handler),
            _phantom: PhantomData,
        };
        self.insert(func, CallShape::Unary, Box::new(handler))
    }

    /// Register a method reading a request stream and answering once.
    pub fn register_client_streaming<F, Req, Resp, Fut>(&mut self, func: &str, handler: F) -> &mut Self
    where
        F: Fn(CallContext, StreamReceiver<Req>) -> Fut + Send + Sync + 'static,
        Req: StreamMessage,
        Resp: StreamMessage,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        let handler = ClientStreamingHandler {
            handler: Arc::new(handler),
            _phantom: PhantomData,
        };
        self.insert(func, CallShape::ClientStreaming, Box::new(handler))
    }

    /// Register a method answering one request with a response stream.
    ///
    /// The stream is closed with ret 0 when the handler returns `Ok`.
    pub fn register_server_streaming<F, Req, Resp, Fut>(&mut self, func: &str, handler: F) -> &mut Self
    where
        F: Fn(CallContext, Req, StreamSender<Resp>) -> Fut + Send + Sync + 'static,
        Req: StreamMessage,
        Resp: StreamMessage,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = ServerStreamingHandler {
            handler: Arc::new(handler),
            _phantom: PhantomData,
        };
        self.insert(func, CallShape::ServerStreaming, Box::new(handler))
    }

    /// Register a method with independent streams in both directions.
    pub fn register_bidi<F, Req, Resp, Fut>(&mut self, func: &str, handler: F) -> &mut Self
    where
        F: Fn(CallContext, StreamReceiver<Req>, StreamSender<Resp>) -> Fut + Send + Sync + 'static,
        Req: StreamMessage,
        Resp: StreamMessage,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = BidiHandler {
            handler: Arc::new(handler),
            _phantom: PhantomData,
        };
        self.insert(func, CallShape::Bidi, Box::new(handler))
    }

    pub fn contains(&self, func: &str) -> bool {
        self.methods.contains_key(func)
    }

    /// Call shape of a registered method.
    pub fn shape(&self, func: &str) -> Option<CallShape> {
        self.methods.get(func).map(|e| e.shape)
    }

    pub(crate) fn lookup(&self, func: &str) -> Option<(CallShape, &dyn Handler)> {
        self.methods
            .get(func)
            .map(|e| (e.shape, e.handler.as_ref()))
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RawPayload;

    async fn unary(_ctx: CallContext, req: RawPayload) -> Result<RawPayload> {
        Ok(req)
    }

    async fn client_streaming(_ctx: CallContext, _rx: StreamReceiver<RawPayload>) -> Result<RawPayload> {
        Ok(RawPayload::from(b"done".to_vec()))
    }

    async fn server_streaming(
        _ctx: CallContext,
        _req: RawPayload,
        _tx: StreamSender<RawPayload>,
    ) -> Result<()> {
        Ok(())
    }

    async fn bidi(
        _ctx: CallContext,
        _rx: StreamReceiver<RawPayload>,
        _tx: StreamSender<RawPayload>,
    ) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_register_shapes() {
        let mut services = ServiceRegistry::new();
        services
            .register_unary("/t/Unary", unary)
            .register_client_streaming("/t/Client", client_streaming)
            .register_server_streaming("/t/Server", server_streaming)
            .register_bidi("/t/Bidi", bidi);

        assert_eq!(services.len(), 4);
        assert_eq!(services.shape("/t/Unary"), Some(CallShape::Unary));
        assert_eq!(services.shape("/t/Client"), Some(CallShape::ClientStreaming));
        assert_eq!(services.shape("/t/Server"), Some(CallShape::ServerStreaming));
        assert_eq!(services.shape("/t/Bidi"), Some(CallShape::Bidi));
        assert!(services.lookup("/t/Missing").is_none());
        assert_eq!(services.methods(), vec!["/t/Bidi", "/t/Client", "/t/Server", "/t/Unary"]);
    }

    #[test]
    fn test_reregistering_replaces() {
        let mut services = ServiceRegistry::new();
        services.register_unary("/t/M", unary);
        services.register_bidi("/t/M", bidi);
        assert_eq!(services.len(), 1);
        assert_eq!(services.shape("/t/M"), Some(CallShape::Bidi));
        assert!(services.contains("/t/M"));
    }
}
