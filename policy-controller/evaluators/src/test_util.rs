use tokio::net::TcpListener;

/// Serves the router built by `routes` on an ephemeral local port, returning its base URL.
pub(crate) async fn serve<F>(routes: F) -> String
where
    F: FnOnce(&str) -> axum::Router,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener must bind");
    let base = format!("http://{}", listener.local_addr().expect("listener has an address"));
    let router = routes(&base);
    tokio::spawn(async move { axum::serve(listener, router).await });
    base
}
