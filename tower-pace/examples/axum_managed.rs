use axum::{
    Router, error_handling::HandleErrorLayer, extract::Request, http::StatusCode,
    response::IntoResponse, routing::get,
};
use pace_limit::ReservationLimiter;
use std::sync::Arc;
use std::time::Duration;
use tower::BoxError;
use tower::ServiceBuilder;
use tower_pace::{ManagedRateLimitLayer, PaceError};

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // 1. Setup Strategy: 10 requests per second, bursts of 10
    let strategy = Arc::new(ReservationLimiter::new(10.0, 10)?);

    // 2. Setup Managed Layer
    let managed_layer =
        ManagedRateLimitLayer::<_, Request>::new(strategy, Duration::from_millis(500));

    // 3. Build the Router
    let app = Router::new()
        .route("/", get(|| async { "Hello, Pace!" }))
        .layer(
            ServiceBuilder::new()
                // Outermost: turns BoxError back into a Response
                .layer(HandleErrorLayer::new(handle_pace_error))
                .layer(managed_layer)
                // The Route is Infallible; the managed layer wants BoxError
                .map_err(BoxError::from),
        );

    // 4. Serve
    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
    println!("Listening on http://127.0.0.1:3000");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_pace_error(err: BoxError) -> impl IntoResponse {
    if let Some(pace_err) = err.downcast_ref::<PaceError>() {
        pace_err.clone().into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Service Error").into_response()
    }
}
