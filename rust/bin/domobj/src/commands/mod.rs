pub mod inspect;
pub mod output;
