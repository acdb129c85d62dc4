use std::sync::Arc;

use trawler_core::async_trait;
use trawler_core::error::{Error, Result};
use trawler_core::request::Request;
use trawler_core::response::Response;

/// What a `process_request` hook decided.
#[derive(Debug)]
pub enum RequestVerdict {
    /// Continue to the next middleware, then to the transport
    Continue(Request),
    /// Short-circuit: skip the remaining request middleware and the
    /// transport; the response chain begins at this middleware
    Respond(Response),
    /// Cancel the current request; re-enqueue this one instead
    Reroute(Request),
}

/// What a `process_response` hook decided.
#[derive(Debug)]
pub enum ResponseVerdict {
    /// Pass to the previous middleware
    Respond(Response),
    /// Cancel the current response; re-enqueue this request instead
    Reroute(Request),
}

/// What a `process_exception` hook decided.
#[derive(Debug)]
pub enum ExceptionVerdict {
    /// Propagate the error to the previous middleware
    Propagate(Error),
    /// Convert the failure into a successful response
    Respond(Response),
    /// Re-enqueue this request instead
    Reroute(Request),
}

/// A hook around the download of every request.
///
/// Hooks run in priority order on the request side (lower first) and in
/// reverse on the response side. An `Err` from a hook enters the
/// `process_exception` chain of the preceding middlewares.
#[async_trait]
pub trait DownloaderMiddleware: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Chain position; lower runs earlier on the request side.
    fn priority(&self) -> i32 {
        500
    }

    async fn process_request(&self, request: Request) -> Result<RequestVerdict> {
        Ok(RequestVerdict::Continue(request))
    }

    async fn process_response(&self, response: Response) -> Result<ResponseVerdict> {
        Ok(ResponseVerdict::Respond(response))
    }

    async fn process_exception(&self, _request: &Request, error: Error) -> ExceptionVerdict {
        ExceptionVerdict::Propagate(error)
    }
}

/// Outcome of the request side of the chain, before the transport runs.
#[derive(Debug)]
pub enum PreFetch {
    /// All request hooks passed; dispatch to the transport
    Fetch(Request),
    /// A middleware answered directly; the response already went through
    /// the response chain
    Response(Response),
    /// A middleware replaced the request; re-enqueue it
    Reschedule(Request),
    /// Terminal failure for this request
    Failure(Error),
}

/// Final outcome after the response or exception side of the chain.
#[derive(Debug)]
pub enum FetchOutcome {
    Response(Response),
    Reschedule(Request),
    Failure(Error),
}

/// Ordered downloader-middleware chain, symmetric and reversed on return.
pub struct DownloaderMiddlewareChain {
    middlewares: Vec<Arc<dyn DownloaderMiddleware>>,
}

impl DownloaderMiddlewareChain {
    pub fn new(mut middlewares: Vec<Arc<dyn DownloaderMiddleware>>) -> Self {
        middlewares.sort_by_key(|m| m.priority());
        if log::log_enabled!(log::Level::Debug) {
            let order: Vec<String> = middlewares
                .iter()
                .map(|m| format!("{}({})", m.name(), m.priority()))
                .collect();
            log::debug!("Downloader middleware order: {}", order.join(", "));
        }
        Self { middlewares }
    }

    pub fn empty() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Run the request side of the chain.
    pub async fn pre_fetch(&self, request: Request) -> PreFetch {
        let mut current = request;
        for (index, middleware) in self.middlewares.iter().enumerate() {
            match middleware.process_request(current.clone()).await {
                Ok(RequestVerdict::Continue(request)) => current = request,
                Ok(RequestVerdict::Respond(response)) => {
                    // Response chain begins at this middleware
                    let outcome = self
                        .run_return_chain(ReturnState::Response {
                            response,
                            upto: index + 1,
                        })
                        .await;
                    return outcome.into();
                }
                Ok(RequestVerdict::Reroute(request)) => return PreFetch::Reschedule(request),
                Err(error) => {
                    let outcome = self
                        .run_return_chain(ReturnState::Exception {
                            request: current,
                            error,
                            upto: index + 1,
                        })
                        .await;
                    return outcome.into();
                }
            }
        }
        PreFetch::Fetch(current)
    }

    /// Run the full response side of the chain on a transport response.
    pub async fn post_fetch(&self, response: Response) -> FetchOutcome {
        self.run_return_chain(ReturnState::Response {
            response,
            upto: self.middlewares.len(),
        })
        .await
    }

    /// Run the full exception side of the chain on a transport failure.
    pub async fn on_exception(&self, request: &Request, error: Error) -> FetchOutcome {
        self.run_return_chain(ReturnState::Exception {
            request: request.clone(),
            error,
            upto: self.middlewares.len(),
        })
        .await
    }

    /// Walk the return side of the chain. Responses descend through
    /// `process_response` hooks; an error flips into the exception hooks of
    /// the middlewares before the failure point, and a recovery there flips
    /// back. Iterative because the two sides hand off to each other.
    async fn run_return_chain(&self, mut state: ReturnState) -> FetchOutcome {
        'chain: loop {
            match state {
                ReturnState::Response {
                    response,
                    upto,
                } => {
                    let mut current = response;
                    for index in (0..upto).rev() {
                        let request = current.request.clone();
                        match self.middlewares[index].process_response(current).await {
                            Ok(ResponseVerdict::Respond(response)) => current = response,
                            Ok(ResponseVerdict::Reroute(request)) => {
                                return FetchOutcome::Reschedule(request);
                            }
                            Err(error) => {
                                state = ReturnState::Exception {
                                    request,
                                    error,
                                    upto: index,
                                };
                                continue 'chain;
                            }
                        }
                    }
                    return FetchOutcome::Response(current);
                }
                ReturnState::Exception {
                    request,
                    error,
                    upto,
                } => {
                    let mut current = error;
                    for index in (0..upto).rev() {
                        match self.middlewares[index]
                            .process_exception(&request, current)
                            .await
                        {
                            ExceptionVerdict::Propagate(error) => current = error,
                            ExceptionVerdict::Respond(response) => {
                                // Converted to a success; the response chain
                                // begins at this middleware
                                state = ReturnState::Response {
                                    response,
                                    upto: index + 1,
                                };
                                continue 'chain;
                            }
                            ExceptionVerdict::Reroute(request) => {
                                return FetchOutcome::Reschedule(request);
                            }
                        }
                    }
                    return FetchOutcome::Failure(current);
                }
            }
        }
    }
}

enum ReturnState {
    Response {
        response: Response,
        upto: usize,
    },
    Exception {
        request: Request,
        error: Error,
        upto: usize,
    },
}

impl From<FetchOutcome> for PreFetch {
    fn from(outcome: FetchOutcome) -> Self {
        match outcome {
            FetchOutcome::Response(response) => PreFetch::Response(response),
            FetchOutcome::Reschedule(request) => PreFetch::Reschedule(request),
            FetchOutcome::Failure(error) => PreFetch::Failure(error),
        }
    }
}
