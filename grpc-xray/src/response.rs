/// The reply of a call. For server-streaming calls the message is a stream of messages.
#[derive(Debug)]
pub struct Response<T> {
    message: T,
}

impl<T> Response<T> {
    pub fn new(message: T) -> Self {
        Self { message }
    }

    /// Consumes `self`, returning the message
    pub fn into_inner(self) -> T {
        self.message
    }

    pub fn map<F, U>(self, f: F) -> Response<U>
    where
        F: FnOnce(T) -> U,
    {
        Response {
            message: f(self.message),
        }
    }
}
