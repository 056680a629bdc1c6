mod client_retry;
mod turn_flow;
