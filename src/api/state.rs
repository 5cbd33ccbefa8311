use crate::manager::ExecutionDataManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: ExecutionDataManager,
}
