mod exchange;
mod protocol;
