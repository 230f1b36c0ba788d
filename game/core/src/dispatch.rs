//! Glue between the transport and the game: owns the token → client
//! registry and implements the transport's dispatch trait.

use crate::client::{Behavior, Client};
use crate::handlers;
use crate::state::ServerState;
use hashbrown::HashMap;
use keel::logging;
use rigging::endpoint::{CommandCtx, ConnectionInfo, Dispatch};
use rigging::frame::Header;
use std::sync::{Arc, RwLock};

pub struct ShipServer {
    state: Arc<ServerState>,
    clients: RwLock<HashMap<usize, Arc<Client>>>,
    log: logging::Logger,
}

impl ShipServer {
    pub fn new(state: Arc<ServerState>, log: &logging::Logger) -> ShipServer {
        ShipServer {
            state,
            clients: RwLock::new(HashMap::new()),
            log: log.new(logging::o!("source" => "ship-server")),
        }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    fn client_for(&self, token: usize) -> Option<Arc<Client>> {
        self.clients.read().unwrap().get(&token).cloned()
    }
}

impl Dispatch for ShipServer {
    fn on_connect(&self, ctx: &mut CommandCtx) {
        let client = Arc::new(Client::new(
            ctx.info.version,
            Behavior::from_tag(ctx.info.tag),
            ctx.info.token,
            ctx.conduit.clone(),
            ctx.info.local_addr,
            ctx.info.peer_addr,
        ));
        self.clients.write().unwrap().insert(ctx.info.token, client.clone());
        handlers::process_connect(&self.state, &client, ctx);
    }

    fn on_command(
        &self,
        ctx: &mut CommandCtx,
        header: Header,
        payload: &[u8],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let client = match self.client_for(ctx.info.token) {
            Some(client) => client,
            None => return Ok(()),
        };

        logging::debug!(self.log, "command received";
                        "command" => header.command,
                        "flag" => header.flag,
                        "size" => header.size,
                        "version" => client.version.name());

        handlers::process_command(&self.state, &client, ctx, header.command, header.flag, payload)
            .map_err(|err| Box::new(err) as Box<dyn std::error::Error + Send + Sync>)
    }

    fn on_disconnect(&self, info: &ConnectionInfo) {
        let client = self.clients.write().unwrap().remove(&info.token);
        if let Some(client) = client {
            handlers::process_disconnect(&self.state, &client);
        }
    }
}
