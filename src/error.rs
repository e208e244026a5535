#[derive(Debug)]
pub struct AppError {
    pub message: String,
}

impl AppError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[macro_export]
macro_rules! app_error {
    ($($arg:tt)*) => {
        $crate::error::AppError {
            message: format!($($arg)*),
        }
    };
}

#[macro_export]
macro_rules! app_err {
    ($($arg:tt)*) => {
        Err($crate::app_error!($($arg)*))
    };
}

impl std::error::Error for AppError {}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        app_error!("Invalid database settings: {err}")
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}
