pub mod file_board;

pub use file_board::FileBoardStore;
