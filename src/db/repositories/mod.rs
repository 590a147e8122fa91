pub mod terminal_record_repository;

pub use terminal_record_repository::TerminalRecordRepository;
