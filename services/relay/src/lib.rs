pub mod proxy;

pub use proxy::{
    build_dialer_factory, AllowList, ConnectionHandler, DialerFactory, HandlerError, Listener,
    ListenerConfig, ListenerStats, Network, Protocol,
};
