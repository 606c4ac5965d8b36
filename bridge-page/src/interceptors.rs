//! Request and response pipeline stages
//!
//! Interceptors run in registration order on the raw fetch arguments, before
//! normalization, so body limits and bridge options apply to what they
//! return. Response handlers run in registration order once a call resolves.

use crate::response::Response;
use async_trait::async_trait;
use crate::request::{FetchInput, RequestInit};
use bridge_common::BridgeError;
use std::future::Future;

#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    async fn intercept(&self, input: FetchInput, init: RequestInit) -> Result<(FetchInput, RequestInit), BridgeError>;
}

#[async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn handle(&self, response: Response) -> Result<Response, BridgeError>;
}

#[async_trait]
impl<F, Fut> RequestInterceptor for F
where
    F: Fn(FetchInput, RequestInit) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(FetchInput, RequestInit), BridgeError>> + Send,
{
    async fn intercept(&self, input: FetchInput, init: RequestInit) -> Result<(FetchInput, RequestInit), BridgeError> {
        self(input, init).await
    }
}

#[async_trait]
impl<F, Fut> ResponseHandler for F
where
    F: Fn(Response) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, BridgeError>> + Send,
{
    async fn handle(&self, response: Response) -> Result<Response, BridgeError> {
        self(response).await
    }
}
