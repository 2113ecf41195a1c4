use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, error, info, info_span, Instrument};

use crate::errors::Result;
use crate::metrics::{ACTIVE_SESSIONS, SESSIONS_TOTAL};
use crate::session::{ProtocolSession, SessionContext};

pub async fn bind(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!("Device listener bound to {}", listener.local_addr()?);
    Ok(listener)
}

/// Accept device connections forever, one task per connection.
pub async fn serve(listener: TcpListener, ctx: SessionContext) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                // Usually descriptor exhaustion; back off instead of spinning.
                error!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", peer, e);
        }

        SESSIONS_TOTAL.inc();
        ACTIVE_SESSIONS.inc();
        let session = ProtocolSession::new(ctx.clone(), stream);
        tokio::spawn(
            async move {
                let outcome = session.run().await;
                debug!("Session finished: {:?}", outcome);
                ACTIVE_SESSIONS.dec();
            }
            .instrument(info_span!("session", %peer)),
        );
    }
}
