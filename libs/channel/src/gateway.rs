use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tether_fabric::codec::Codec;
use tether_fabric::transport::{Transport, TransportListener};
use tracing::{debug, info};

use crate::binding::BoundType;
use crate::channel::{ChannelCore, Role};
use crate::driver::{spawn_channel, AcceptHook, ChannelOptions, Handshake};
use crate::envelope::Hello;
use crate::error::{Error, Result};
use crate::handle::ChannelHandle;
use crate::payload::Payload;
use crate::runtime::ActorHandle;

/// An actor and the interfaces to bind it with
pub type Binding<P> = (ActorHandle<P>, Vec<BoundType<<P as Payload>::Interface>>);

type InitialActors<P> = Arc<dyn Fn(&ChannelHandle<P>) -> Vec<Binding<P>> + Send + Sync>;

type TokenActor<P> = Box<dyn FnOnce(&ChannelHandle<P>) -> Binding<P> + Send>;

/// Accepts connections and runs one server channel per connection
pub struct Gateway<P: Payload, C> {
    codec: C,
    options: ChannelOptions,
    initial_actors: Option<InitialActors<P>>,
    tokens: Arc<Mutex<HashMap<String, TokenActor<P>>>>,
    accepted: AtomicU64,
}

impl<P, C> Gateway<P, C>
where
    P: Payload,
    C: Codec + Clone + 'static,
{
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            options: ChannelOptions {
                name: "gateway".to_string(),
                ..ChannelOptions::default()
            },
            initial_actors: None,
            tokens: Arc::new(Mutex::new(HashMap::new())),
            accepted: AtomicU64::new(0),
        }
    }

    /// Options for every accepted channel; the name gets a sequence suffix
    pub fn with_options(mut self, options: ChannelOptions) -> Self {
        self.options = options;
        self
    }

    /// Actors to bind on every new channel, in order, after any token actor
    ///
    /// `make` runs once per channel, before it opens, with that channel's
    /// handle so the actors can be spawned on it.
    pub fn with_initial_actors<F>(mut self, make: F) -> Self
    where
        F: Fn(&ChannelHandle<P>) -> Vec<Binding<P>> + Send + Sync + 'static,
    {
        self.initial_actors = Some(Arc::new(make));
        self
    }

    /// Reserve an actor for the first client whose hello carries `token`
    ///
    /// `make` runs once, on the channel that presents the token, so the
    /// actor can be spawned on that channel's handle. It is bound at id 1,
    /// ahead of the initial actors. Registering the same token again
    /// replaces the earlier factory.
    pub fn register_token<F>(&self, token: impl Into<String>, make: F)
    where
        F: FnOnce(&ChannelHandle<P>) -> Binding<P> + Send + 'static,
    {
        self.tokens.lock().insert(token.into(), Box::new(make));
    }

    /// Tokens registered and not yet used
    pub fn pending_tokens(&self) -> usize {
        self.tokens.lock().len()
    }

    /// Run a server channel over an accepted transport
    pub fn accept(&self, transport: impl Transport + 'static) -> ChannelHandle<P> {
        let sequence = self.accepted.fetch_add(1, Ordering::Relaxed) + 1;
        let options = ChannelOptions {
            name: format!("{}-{}", self.options.name, sequence),
            ..self.options.clone()
        };
        let transport: Box<dyn Transport> = Box::new(transport);
        spawn_channel(
            Box::pin(async move { Ok::<_, tether_fabric::Error>(transport) }),
            self.codec.clone(),
            Role::Server,
            Handshake::Accept(self.accept_hook()),
            options,
            None,
        )
    }

    fn accept_hook(&self) -> AcceptHook<P> {
        let tokens = self.tokens.clone();
        let initial_actors = self.initial_actors.clone();
        Box::new(move |hello: Hello, core: &mut ChannelCore<P>| {
            if let Some(token) = hello.token {
                let make = tokens
                    .lock()
                    .remove(&token)
                    .ok_or_else(|| Error::Rejected("unknown connect token".to_string()))?;
                let handle = core.handle().clone();
                let (actor, types) = make(&handle);
                let actor_id = core.bind(actor, types)?;
                debug!(actor_id, "token actor bound");
            }
            if let Some(make) = initial_actors {
                let handle = core.handle().clone();
                for (actor, types) in make(&handle) {
                    core.bind(actor, types)?;
                }
            }
            Ok(())
        })
    }

    /// Accept until the listener fails, spawning a channel per connection
    pub async fn serve<L: TransportListener>(&self, listener: &L) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok(transport) => {
                    let channel = self.accept(transport);
                    debug!(?channel, "connection accepted");
                }
                Err(error) => {
                    info!(%error, "listener stopped");
                    return Err(error.into());
                }
            }
        }
    }
}
