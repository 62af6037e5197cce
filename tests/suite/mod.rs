mod context;
mod request;
mod session;
