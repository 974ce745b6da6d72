pub mod mdcore;
