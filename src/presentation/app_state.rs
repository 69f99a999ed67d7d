// Application state for HTTP handlers
use crate::infrastructure::plot_feed::PlotFeed;

#[derive(Clone)]
pub struct AppState {
    pub plot_feed: PlotFeed,
    pub total_setpoints: usize,
}
