/// Declares an RPC service: a `Service` trait for the server side, a
/// typed `Client` over an [`Endpoint`](crate::Endpoint), and a `serve`
/// function that adapts a `Service` into the fabric's raw handler.
///
/// ```ignore
/// simrpc::service! {
///     service echo {
///         rpc ping(PingRequest) returns (PingReply);
///     }
/// }
/// ```
#[macro_export]
macro_rules! service {
    (
        $(#[$service_attr:meta])*
        service $svc_name:ident {
            $(
                $(#[$method_attr:meta])*
                rpc $method_name:ident($input:ty) returns ($output:ty);
            )*
        }
    ) => {
        $(#[$service_attr])*
        pub mod $svc_name {
            // so the macro body can find the request/reply types
            use super::*;

            #[async_trait::async_trait]
            pub trait Service: Clone + Send + Sync + 'static {
                $(
                    $(#[$method_attr])*
                    async fn $method_name(&self, req: $input) -> $crate::Result<$output>;
                )*
            }

            #[derive(Clone)]
            pub struct Client {
                end: $crate::Endpoint,
            }

            impl Client {
                pub fn new(end: $crate::Endpoint) -> Client {
                    Client { end }
                }

                $(pub fn $method_name(&self, args: &$input) -> $crate::RpcFuture<$crate::Result<$output>> {
                    self.end.call(stringify!($method_name), args)
                })*
            }

            struct Glue<T> {
                svc: T,
            }

            impl<T: Service> $crate::RpcHandler for Glue<T> {
                fn handle(&self, method: &str, req: &[u8]) -> $crate::RpcFuture<$crate::Result<Vec<u8>>> {
                    match method {
                        $(stringify!($method_name) => {
                            let request = match simcodec::decode(req) {
                                Ok(request) => request,
                                Err(e) => {
                                    return Box::pin(futures::future::err(
                                        $crate::RpcError::Codec(e.to_string()),
                                    ))
                                }
                            };
                            let svc = self.svc.clone();
                            Box::pin(async move {
                                let reply = svc.$method_name(request).await?;
                                let mut buf = vec![];
                                simcodec::encode(&reply, &mut buf)
                                    .map_err(|e| $crate::RpcError::Codec(e.to_string()))?;
                                Ok(buf)
                            })
                        })*
                        other => Box::pin(futures::future::err($crate::RpcError::NoMethod(
                            format!("{}.{}", stringify!($svc_name), other),
                        ))),
                    }
                }
            }

            /// Wraps a service implementation for `Server::new`.
            pub fn serve<T: Service>(svc: T) -> ::std::sync::Arc<dyn $crate::RpcHandler> {
                ::std::sync::Arc::new(Glue { svc })
            }
        }
    };
}
