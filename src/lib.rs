pub mod database_ops;
pub mod logging;

pub mod util {
    pub mod env;
    pub mod prompt;
}
