// Export route modules
pub mod audio;
pub mod chat;
pub mod completion;
pub mod image;
pub mod reply;
pub mod structured;

use axum::Router;
use crate::state::AppState;

// Function to configure all routes
pub fn configure(state: AppState) -> Router {
    Router::new()
        .merge(chat::routes(state.clone()))
        .merge(completion::routes(state.clone()))
        .merge(structured::routes(state.clone()))
        .merge(audio::routes(state.clone()))
        .merge(image::routes(state))
}
