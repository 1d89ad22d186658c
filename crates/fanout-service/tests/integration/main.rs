mod http_transport;
mod orchestrator;
