mod handlers;
mod routes;
mod server;

pub use routes::create_router;
pub use server::HttpServer;
