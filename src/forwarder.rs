use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

const PUMP_BUFFER_SIZE: usize = 16 * 1024;

async fn pipe<R, W>(reader: &mut ReadHalf<R>, writer: &mut WriteHalf<W>)
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut buffer = vec![0u8; PUMP_BUFFER_SIZE];
    loop {
        let read = match reader.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(read) => read,
        };
        if writer.write_all(&buffer[..read]).await.is_err() {
            break;
        }
    }
}

// Copies bytes in both directions until either half completes, then
// closes both connections. Only returns once both halves have
// terminated, so neither side is left half-open.
pub(crate) async fn pump<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut a_reader, mut a_writer) = tokio::io::split(a);
    let (mut b_reader, mut b_writer) = tokio::io::split(b);
    let mut forward = tokio::spawn(async move {
        pipe(&mut a_reader, &mut b_writer).await;
        let _ = b_writer.shutdown().await;
    });
    let backward = async {
        pipe(&mut b_reader, &mut a_writer).await;
        let _ = a_writer.shutdown().await;
    };
    tokio::pin!(backward);
    tokio::select! {
        _ = &mut forward => {}
        _ = &mut backward => {
            forward.abort();
            let _ = forward.await;
        }
    }
    // Both transports are dropped here, closing whatever the shutdowns
    // above did not already tear down.
}

#[cfg(test)]
mod pump_tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        time::timeout,
    };

    use super::pump;

    #[tokio::test]
    async fn relays_data_in_both_directions() {
        let (mut client, downstream) = tokio::io::duplex(256);
        let (upstream, mut server) = tokio::io::duplex(256);
        let handle = tokio::spawn(pump(downstream, upstream));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client);
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("pump should finish after one side closes")
            .unwrap();
    }

    #[tokio::test]
    async fn closing_one_side_closes_the_other() {
        let (client, downstream) = tokio::io::duplex(256);
        let (upstream, mut server) = tokio::io::duplex(256);
        let handle = tokio::spawn(pump(downstream, upstream));

        drop(client);
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("pump should finish after one side closes")
            .unwrap();
        // The remaining peer sees end-of-stream once the pump returns.
        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_secs(1), server.read(&mut buf))
            .await
            .expect("peer should be closed")
            .unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn server_side_close_propagates_to_client() {
        let (mut client, downstream) = tokio::io::duplex(256);
        let (upstream, server) = tokio::io::duplex(256);
        let handle = tokio::spawn(pump(downstream, upstream));

        drop(server);
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("pump should finish after one side closes")
            .unwrap();
        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_secs(1), client.read(&mut buf))
            .await
            .expect("peer should be closed")
            .unwrap();
        assert_eq!(read, 0);
    }
}
