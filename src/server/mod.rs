pub mod handler;

pub use self::handler::DnsHandler;
