use crate::adapter::{BoxedStream, ConnectionInterceptor, DispatchHook, RelayBinding};
use crate::error::{EngineError, Result};
use fast_socks5::server::{Socks5ServerProtocol, SocksServerError};
use fast_socks5::util::target_addr::TargetAddr;
use fast_socks5::{ReplyError, Socks5Command};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Local SOCKS5 endpoint the engine routes user traffic through.
///
/// The SOCKS5 username names the user the engine matched; the password is
/// the per-instance token so nothing else can use the relay.
pub struct DispatchRelay {
    addr: String,
    token: String,
    interceptor: RwLock<Option<Arc<dyn ConnectionInterceptor>>>,
}

impl DispatchRelay {
    pub fn new(binding: &RelayBinding) -> Arc<Self> {
        Arc::new(Self {
            addr: binding.addr.clone(),
            token: binding.token.clone(),
            interceptor: RwLock::new(None),
        })
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(&self.addr)
            .await
            .map_err(|e| EngineError::Relay(format!("failed to bind {}: {}", self.addr, e)))
    }

    /// Accepts connections until `cancel` fires.
    pub fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Dispatch relay listening on {}", self.addr);
            loop {
                let (stream, peer) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Dispatch relay accept failed: {}", e);
                            continue;
                        }
                    },
                };
                let relay = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = relay.handle(stream, cancel).await {
                        debug!("Relay connection from {} ended: {}", peer, e);
                    }
                });
            }
            info!("Dispatch relay on {} stopped", self.addr);
        })
    }

    async fn handle(&self, stream: TcpStream, cancel: CancellationToken) -> Result<()> {
        let identity = Mutex::new(None);
        let authenticated = Socks5ServerProtocol::accept_password_auth(stream, |user, pass| {
            let accepted = pass == self.token;
            if accepted {
                *identity.lock() = Some(user);
            }
            accepted
        })
        .await
        .map_err(socks_error)?
        .0;
        let identity = identity.into_inner().unwrap_or_default();

        let (protocol, command, target) = authenticated.read_command().await.map_err(socks_error)?;
        if command != Socks5Command::TCPConnect {
            let _ = protocol.reply_error(&ReplyError::CommandNotSupported).await;
            return Err(EngineError::Relay(format!("unsupported command {:?}", command)));
        }

        let mut upstream = match connect(&target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                let _ = protocol.reply_error(&ReplyError::HostUnreachable).await;
                return Err(e);
            }
        };
        let bound = upstream
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let engine_side = protocol.reply_success(bound).await.map_err(socks_error)?;

        debug!("Relaying {} for {}", target, identity);
        let engine_side: BoxedStream = Box::new(engine_side);
        let interceptor = self.interceptor.read().clone();
        let mut engine_side = match interceptor {
            Some(interceptor) => interceptor.intercept(&identity, engine_side),
            None => engine_side,
        };

        tokio::select! {
            _ = cancel.cancelled() => {}
            result = tokio::io::copy_bidirectional(&mut engine_side, &mut upstream) => {
                match result {
                    Ok((up, down)) => debug!("Relay for {} done: {} up, {} down", identity, up, down),
                    Err(e) => debug!("Relay for {} ended: {}", identity, e),
                }
            }
        }
        Ok(())
    }
}

impl DispatchHook for DispatchRelay {
    fn install(&self, interceptor: Arc<dyn ConnectionInterceptor>) {
        *self.interceptor.write() = Some(interceptor);
    }
}

async fn connect(target: &TargetAddr) -> Result<TcpStream> {
    let stream = match target {
        TargetAddr::Ip(addr) => TcpStream::connect(addr).await,
        TargetAddr::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
    };
    stream.map_err(|e| {
        warn!("Relay failed to reach {}: {}", target, e);
        EngineError::Relay(format!("connect to {} failed: {}", target, e))
    })
}

fn socks_error(e: SocksServerError) -> EngineError {
    EngineError::Relay(e.to_string())
}

/// Random password shared between one engine instance and its relay.
pub fn generate_token() -> String {
    format!("{:032x}", rand::random::<u128>())
}
